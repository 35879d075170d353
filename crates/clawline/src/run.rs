// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level process bootstrap — shared by `main` and the black-box test
//! harness: open the durable store, start the pairing watcher and
//! background maintenance sweeps, bind the HTTP/WebSocket listener, and
//! run until a shutdown signal arrives (spec §5).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::assets;
use crate::config::Config;
use crate::db;
use crate::dispatcher::{NullDispatcher, ReplyDispatcher};
use crate::ingestion::{self, IngestionDeps};
use crate::pairing::PairingStore;
use crate::ratelimit::SlidingWindowLimiter;
use crate::session::SessionRegistry;
use crate::transport::state::AppState;

const IDEMPOTENCY_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const ASSET_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
/// Orphaned assets younger than this are kept a while longer, since a
/// message referencing them may still be mid-flight through the
/// ingestion pipeline when the sweep runs (spec §4.7).
const ASSET_MIN_ORPHAN_AGE: Duration = Duration::from_secs(86400);

pub struct RunResult {
    pub state: Arc<AppState>,
}

/// Initialize tracing/logging from config. Uses `try_init` so it's safe
/// to call more than once (e.g. from the test harness).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = if std::env::var("RUST_LOG").is_err() {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Build every piece of shared state, start background tasks, bind the
/// listener, and run the server until `shutdown` is cancelled.
pub async fn run(config: Config) -> anyhow::Result<RunResult> {
    run_with_dispatcher(config, Arc::new(NullDispatcher)).await
}

/// Same as [`run`], but with an explicit reply dispatcher — the test
/// harness and any embedder wiring a real backend agent runtime use this
/// directly.
pub async fn run_with_dispatcher(config: Config, dispatcher: Arc<dyn ReplyDispatcher>) -> anyhow::Result<RunResult> {
    init_tracing(&config);
    config.validate()?;

    tokio::fs::create_dir_all(&config.state_dir).await?;
    tokio::fs::create_dir_all(config.assets_dir()).await?;
    tokio::fs::create_dir_all(config.tmp_dir()).await?;

    let pool = db::connect(&config.sqlite_path()).await?;
    let pairing = Arc::new(PairingStore::open(&config.state_dir, &config.jwt_key_path())?);
    let sessions = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();

    {
        let pairing = pairing.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { crate::pairing::watch::run(pairing, shutdown).await });
    }

    spawn_idempotency_sweep(pool.clone(), config.stream_idempotency_retention_seconds, shutdown.clone());
    spawn_asset_sweep(pool.clone(), config.assets_dir(), shutdown.clone());

    let ingestion_deps = Arc::new(IngestionDeps {
        pool: pool.clone(),
        sessions: sessions.clone(),
        dispatcher: dispatcher.clone(),
        assets_dir: config.assets_dir(),
        tmp_dir: config.tmp_dir(),
        admin_global_stream_key: config.admin_global_stream_key.clone(),
        max_upload_bytes: config.max_upload_bytes,
        media_fetch_timeout: Duration::from_secs(config.media_fetch_timeout_seconds),
    });
    let ingestion_queue = ingestion::build_queue(ingestion_deps);

    let pair_limiter = SlidingWindowLimiter::new(config.max_pair_per_minute, Duration::from_secs(60));
    let message_limiter = SlidingWindowLimiter::new(config.max_messages_per_second, Duration::from_secs(1));

    let state = Arc::new(AppState {
        config: config.clone(),
        pool,
        pairing,
        sessions,
        pair_limiter,
        message_limiter,
        ingestion: ingestion_queue,
        dispatcher,
        shutdown: shutdown.clone(),
    });

    let router = crate::transport::build_router(state.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let server = {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        })
    };

    spawn_signal_handler(shutdown);

    if let Err(e) = server.await {
        error!(error = %e, "HTTP server task panicked");
    }

    Ok(RunResult { state })
}

/// Periodically prune stream-catalog idempotency records older than the
/// configured retention window (spec §4.3, §4.9).
fn spawn_idempotency_sweep(pool: sqlx::SqlitePool, retention_seconds: u64, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(IDEMPOTENCY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let before_ms = db::epoch_ms() - (retention_seconds as i64 * 1000);
            match db::idempotency::prune_older_than(&pool, before_ms).await {
                Ok(pruned) if pruned > 0 => info!(pruned, "pruned expired idempotency records"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "idempotency prune failed"),
            }
        }
    });
}

/// Periodically delete orphaned asset files (and their DB rows) once
/// they've been unreferenced for longer than `ASSET_MIN_ORPHAN_AGE`
/// (spec §4.7 "asset lifecycle").
fn spawn_asset_sweep(pool: sqlx::SqlitePool, assets_dir: std::path::PathBuf, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ASSET_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let before_ms = db::epoch_ms() - ASSET_MIN_ORPHAN_AGE.as_millis() as i64;
            let orphans = match db::assets::unreferenced_older_than(&pool, before_ms).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "asset sweep lookup failed");
                    continue;
                }
            };

            for row in orphans {
                let mut tx = match pool.begin().await {
                    Ok(tx) => tx,
                    Err(e) => {
                        warn!(error = %e, "asset sweep failed to open transaction");
                        continue;
                    }
                };
                if let Err(e) = db::assets::delete(&mut tx, &row.asset_id).await {
                    warn!(error = %e, asset_id = %row.asset_id, "asset sweep failed to delete row");
                    continue;
                }
                if let Err(e) = tx.commit().await {
                    warn!(error = %e, asset_id = %row.asset_id, "asset sweep failed to commit");
                    continue;
                }
                if let Err(e) = assets::delete(&assets_dir, &row.asset_id).await {
                    warn!(error = %e, asset_id = %row.asset_id, "asset sweep failed to remove file");
                }
            }
        }
    });
}

/// First SIGTERM/SIGINT cancels `shutdown` for a graceful drain; a
/// second forces an immediate exit (spec §5 "Cancellation").
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGTERM");
            }
            _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async { if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async { if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await } } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}
