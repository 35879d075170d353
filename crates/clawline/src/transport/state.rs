// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application state passed to every axum handler via the `State`
//! extractor.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatcher::ReplyDispatcher;
use crate::ingestion::IngestionJob;
use crate::pairing::PairingStore;
use crate::queue::KeyedQueue;
use crate::ratelimit::SlidingWindowLimiter;
use crate::session::SessionRegistry;

pub struct AppState {
    pub config: Config,
    pub pool: SqlitePool,
    pub pairing: Arc<PairingStore>,
    pub sessions: Arc<SessionRegistry>,
    pub pair_limiter: SlidingWindowLimiter,
    pub message_limiter: SlidingWindowLimiter,
    pub ingestion: KeyedQueue<IngestionJob>,
    pub dispatcher: Arc<dyn ReplyDispatcher>,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("outbound_token", &self.config.outbound_token.is_some())
            .finish()
    }
}
