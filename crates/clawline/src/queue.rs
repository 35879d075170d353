// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user, per-stream keyed task queue (spec §4.5 concurrency model).
//!
//! Ingestion work sharing a `(userId, streamKey)` key runs on a single
//! lane, in order; a message with no `sessionKey` falls back to a
//! per-user lane. One job failing doesn't poison later jobs on the same
//! lane — failures are logged and the lane keeps draining.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

type BoxFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A registry of per-key FIFO lanes, each drained by its own task.
///
/// Lanes are created lazily on first use and never torn down — the key
/// space is bounded by live streams/users, so an idle lane parked on an
/// empty channel is cheap to keep around for the life of the process.
pub struct KeyedQueue<J: Send + 'static> {
    process: Arc<dyn Fn(J) -> BoxFuture + Send + Sync>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<J>>>,
}

impl<J: Send + 'static> KeyedQueue<J> {
    pub fn new<F>(process: F) -> Self
    where
        F: Fn(J) -> BoxFuture + Send + Sync + 'static,
    {
        Self { process: Arc::new(process), lanes: Mutex::new(HashMap::new()) }
    }

    /// Enqueue `job` on the lane for `key`, spawning a worker if one
    /// doesn't already exist (or has died).
    pub fn enqueue(&self, key: &str, job: J) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(tx) = lanes.get(key) {
            match tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned_job)) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let _ = tx.send(returned_job);
                    tokio::spawn(run_lane(rx, self.process.clone()));
                    lanes.insert(key.to_owned(), tx);
                    return;
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        tokio::spawn(run_lane(rx, self.process.clone()));
        lanes.insert(key.to_owned(), tx);
    }

    /// The lane key for a unit of work: `(userId, streamKey)` when a
    /// stream is known, otherwise a user-level fallback.
    pub fn key_for(user_id: &str, stream_key: Option<&str>) -> String {
        match stream_key {
            Some(key) => format!("{user_id}\u{0}{key}"),
            None => format!("{user_id}\u{0}__default__"),
        }
    }
}

async fn run_lane<J>(mut rx: mpsc::UnboundedReceiver<J>, process: Arc<dyn Fn(J) -> BoxFuture + Send + Sync>) {
    while let Some(job) = rx.recv().await {
        if let Err(e) = process(job).await {
            warn!(error = %e, "queued job failed, lane continues");
        }
    }
}
