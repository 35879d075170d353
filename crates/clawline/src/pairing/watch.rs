// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Watches the allowlist/pending/denylist files for external edits and
//! reconciles them into the in-memory [`super::PairingStore`].
//!
//! Uses `notify` for filesystem events with a polling fallback, mirroring
//! the session log watcher. Parse failures revert to the last known good
//! state without surfacing an error to live clients (spec §7 propagation
//! policy).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::PairingStore;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until `shutdown` is cancelled. Reconciles on every filesystem
/// event and on a 5-second poll tick, whichever comes first.
pub async fn run(store: Arc<PairingStore>, shutdown: CancellationToken) {
    let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
    let _watcher = setup_notify_watcher(&store, wake_tx);

    let mut poll_interval = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake_rx.recv() => {}
            _ = poll_interval.tick() => {}
        }

        if let Err(e) = store.reconcile_from_disk() {
            warn!(error = %e, "pairing store reconcile failed, keeping last known good state");
        }
    }
}

fn setup_notify_watcher(store: &PairingStore, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;

    let watch_dir = store.state_dir();
    watcher.watch(watch_dir, RecursiveMode::NonRecursive).ok()?;

    Some(watcher)
}
