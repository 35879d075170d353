// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Ingestion Pipeline (spec §4.6): validate an inbound `message` frame,
//! persist it to the event log, ack and fan it out, then drive the
//! reply dispatcher to produce the assistant's side of the conversation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::warn;

use crate::assets;
use crate::attachments::{self, NormalizedAttachment};
use crate::db;
use crate::db::messages::StreamingState;
use crate::db::streams::StreamKind;
use crate::dispatcher::{DeliveredPayload, InboundContext, ReplyDispatcher};
use crate::error::{ApiError, ErrorCode};
use crate::fanout::{self, MessagePayload};
use crate::ids::{self, StreamKeyParts};
use crate::queue::KeyedQueue;
use crate::ratelimit::SlidingWindowLimiter;
use crate::session::{Session, SessionRegistry};
use crate::transport::ws_msg::{Attachment, ServerMessage};

/// Everything the per-lane worker needs to finish processing one
/// already-admitted inbound message; built by [`handle_inbound`] and
/// driven to completion by [`process`].
pub struct IngestionDeps {
    pub pool: SqlitePool,
    pub sessions: Arc<SessionRegistry>,
    pub dispatcher: Arc<dyn ReplyDispatcher>,
    pub assets_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub admin_global_stream_key: String,
    pub max_upload_bytes: usize,
    pub media_fetch_timeout: Duration,
}

pub enum IngestionJob {
    /// A never-before-seen `(deviceId, clientId)`: persist the user event
    /// and message record, then dispatch for a reply.
    New {
        session: Arc<Session>,
        client_id: String,
        content: String,
        session_key: String,
        stream_kind: StreamKind,
        attachments: Vec<NormalizedAttachment>,
        content_hash: String,
        attachments_hash: String,
    },
    /// A byte-identical retry of a `clientId` whose prior attempt left no
    /// assistant reply (`streamingState=Failed`, spec §4.6 step 6). The
    /// user event already exists and is never re-persisted or re-sent to
    /// the user's stream; only the dispatcher is re-run.
    RetryReply {
        session: Arc<Session>,
        client_id: String,
        content: String,
        session_key: String,
        stream_kind: StreamKind,
        server_event_id: String,
    },
}

/// Build the keyed lane queue that drains [`IngestionJob`]s, one lane per
/// `(userId, streamKey)` (spec §4.5).
pub fn build_queue(deps: Arc<IngestionDeps>) -> KeyedQueue<IngestionJob> {
    KeyedQueue::new(move |job| {
        let deps = deps.clone();
        Box::pin(async move {
            match job {
                IngestionJob::New { .. } => process_new(&deps, job).await,
                IngestionJob::RetryReply { .. } => process_retry(&deps, job).await,
            }
        })
    })
}

/// Classify a resolved session key against the grammar and the
/// deployment's admin stream (spec §4.6 step 2).
fn classify(session_key: &str, stream: &StreamKeyParts, admin_global_stream_key: &str) -> StreamKind {
    if session_key == admin_global_stream_key {
        StreamKind::GlobalDm
    } else {
        match stream.suffix.as_str() {
            "main" => StreamKind::Main,
            "dm" => StreamKind::Dm,
            _ => StreamKind::Custom,
        }
    }
}

/// Validate and classify an inbound `message` frame, then hand it to the
/// keyed queue for ordered, per-stream processing (spec §4.6 steps 1-5).
/// Synchronous checks (size, rate limit, attachment policy, admin-only
/// posting) happen here so the caller can turn a rejection directly into
/// an `error` frame without waiting on the lane.
#[allow(clippy::too_many_arguments)]
pub async fn handle_inbound(
    queue: &KeyedQueue<IngestionJob>,
    pool: &SqlitePool,
    session: &Arc<Session>,
    message_limiter: &SlidingWindowLimiter,
    max_message_bytes: usize,
    max_inline_bytes: usize,
    admin_global_stream_key: &str,
    client_id: String,
    content: String,
    session_key: Option<String>,
    raw_attachments: Vec<Attachment>,
) -> Result<(), ApiError> {
    if !ids::is_valid_client_id(&client_id) {
        return Err(ApiError::new(ErrorCode::InvalidMessage, "malformed message id"));
    }
    if content.len() > max_message_bytes {
        return Err(ApiError::new(ErrorCode::PayloadTooLarge, "content exceeds maxMessageBytes"));
    }

    let resolved_key = match session_key {
        Some(key) => key,
        None => session.default_stream_key.read().await.clone(),
    };
    let resolved_key = ids::rewrite_legacy_stream_key(&resolved_key);

    let visible = session.visible_stream_keys.read().await;
    if !visible.contains(&resolved_key) {
        return Err(ApiError::new(ErrorCode::Forbidden, "sessionKey is not visible to this session"));
    }
    drop(visible);

    // The admin global stream's key is an opaque, operator-configured
    // constant rather than a `main|dm|s_xxxxxxxx` stream key, so it is
    // classified before grammar parsing instead of requiring it to parse.
    let (parts, kind) = if resolved_key == admin_global_stream_key {
        let parts = StreamKeyParts { agent_id: String::new(), user_id: session.user_id.clone(), suffix: "global_dm".to_owned() };
        (parts, StreamKind::GlobalDm)
    } else {
        let Some(parts) = ids::parse_stream_key(&resolved_key) else {
            return Err(ApiError::new(ErrorCode::InvalidMessage, "malformed sessionKey"));
        };
        let kind = classify(&resolved_key, &parts, admin_global_stream_key);
        (parts, kind)
    };

    if kind == StreamKind::GlobalDm && !*session.is_admin.read().await {
        return Err(ApiError::new(ErrorCode::Forbidden, "only administrators may post to the admin stream"));
    }

    let content_hash = hex_sha256(content.as_bytes());
    let attachments_hash = attachments::hash_attachments(&raw_attachments);

    if let Some(existing) = db::messages::find(pool, &session.device_id, &client_id).await.map_err(server_error)? {
        if existing.content_hash != content_hash || existing.attachments_hash != attachments_hash {
            return Err(ApiError::new(ErrorCode::InvalidMessage, "clientId reused with different content"));
        }
        db::messages::mark_ack_sent(pool, &session.device_id, &client_id).await.map_err(server_error)?;
        session.send(ServerMessage::Ack { id: client_id.clone() });
        if existing.streaming_state() == StreamingState::Failed {
            // The user event already landed but no assistant reply did;
            // re-run only the dispatch, never the user-event persistence.
            queue.enqueue(
                &KeyedQueue::<IngestionJob>::key_for(&session.user_id, Some(&resolved_key)),
                IngestionJob::RetryReply {
                    session: session.clone(),
                    client_id,
                    content,
                    session_key: resolved_key,
                    stream_kind: kind,
                    server_event_id: existing.server_event_id,
                },
            );
        }
        return Ok(());
    }

    // Rate-limited only past this point: an idempotent retransmit must
    // always replay its ack rather than burn a token and risk a spurious
    // `rate_limited` rejection (spec §4.6 step 6/8).
    if !message_limiter.check(&session.device_id, std::time::Instant::now()) {
        return Err(ApiError::new(ErrorCode::RateLimited, "message rate exceeded"));
    }

    let mut normalized = Vec::with_capacity(raw_attachments.len());
    for attachment in &raw_attachments {
        normalized.push(attachments::normalize(attachment, &parts, max_inline_bytes)?);
    }

    queue.enqueue(
        &KeyedQueue::<IngestionJob>::key_for(&session.user_id, Some(&resolved_key)),
        IngestionJob::New {
            session: session.clone(),
            client_id,
            content,
            session_key: resolved_key,
            stream_kind: kind,
            attachments: normalized,
            content_hash,
            attachments_hash,
        },
    );

    Ok(())
}

/// Drive a never-before-seen message to completion: persist assets,
/// append the event, ack, fan out, then run the reply dispatcher
/// (spec §4.6 steps 6-8).
async fn process_new(deps: &IngestionDeps, job: IngestionJob) -> anyhow::Result<()> {
    let IngestionJob::New { session, client_id, content, session_key, stream_kind, attachments, content_hash, attachments_hash } = job
    else {
        unreachable!("process_new only ever receives IngestionJob::New");
    };

    let now_ms = db::epoch_ms();
    let server_event_id = ids::new_server_event_id();

    let mut persisted_attachments = Vec::with_capacity(attachments.len());

    for normalized in &attachments {
        match normalized {
            NormalizedAttachment::NewAsset { mime_type, bytes } => {
                let asset_id = assets::store_new(&deps.assets_dir, &deps.tmp_dir, bytes).await?;
                let mut tx = deps.pool.begin().await?;
                db::assets::insert(&mut tx, &asset_id, &session.user_id, mime_type, bytes.len() as i64, &session.device_id, now_ms).await?;
                tx.commit().await?;
                persisted_attachments.push((asset_id, mime_type.clone()));
            }
            NormalizedAttachment::ExistingAsset { asset_id } => {
                let owned = db::assets::find_owned(&deps.pool, &session.user_id, asset_id).await?;
                let Some(owned) = owned else {
                    session.send(ServerMessage::Error {
                        code: ErrorCode::AssetNotFound.as_str().to_owned(),
                        message: "referenced asset not found".to_owned(),
                        message_id: Some(client_id.clone()),
                    });
                    return Ok(());
                };
                persisted_attachments.push((asset_id.clone(), owned.mime_type));
            }
        }
    }

    let attachment_refs: Vec<Attachment> =
        persisted_attachments.iter().map(|(asset_id, _)| Attachment::Asset { asset_id: asset_id.clone() }).collect();

    let user_payload = MessagePayload {
        id: server_event_id.clone(),
        role: "user".to_owned(),
        session_key: session_key.clone(),
        timestamp: now_ms,
        streaming: false,
        content: content.clone(),
        attachments: attachment_refs,
        device_id: Some(session.device_id.clone()),
    };
    let payload_json = user_payload.to_payload_json()?;

    let mut tx = deps.pool.begin().await?;
    let event = db::events::append(&mut tx, &server_event_id, &session.user_id, &session_key, "message", Some(&session.device_id), &payload_json).await?;
    db::messages::insert(
        &mut tx,
        &session.device_id,
        &client_id,
        &session.user_id,
        &event.id,
        event.sequence,
        &content_hash,
        &attachments_hash,
        StreamingState::Active,
        now_ms,
    )
    .await?;
    for (asset_id, _) in &persisted_attachments {
        db::messages::link_asset(&mut tx, &session.device_id, &client_id, asset_id).await?;
    }
    tx.commit().await?;

    db::messages::mark_ack_sent(&deps.pool, &session.device_id, &client_id).await?;
    session.send(ServerMessage::Ack { id: client_id.clone() });

    fanout::deliver_message(&deps.sessions, &session.user_id, &user_payload, &deps.admin_global_stream_key).await;

    run_dispatch_and_finalize(deps, &session, &client_id, &session_key, stream_kind, &server_event_id, &content).await
}

/// Re-run only the dispatcher for a `clientId` whose prior attempt
/// persisted the user event but produced no assistant reply
/// (`streamingState=Failed`). The user event is never re-inserted.
async fn process_retry(deps: &IngestionDeps, job: IngestionJob) -> anyhow::Result<()> {
    let IngestionJob::RetryReply { session, client_id, content, session_key, stream_kind, server_event_id } = job else {
        unreachable!("process_retry only ever receives IngestionJob::RetryReply");
    };

    run_dispatch_and_finalize(deps, &session, &client_id, &session_key, stream_kind, &server_event_id, &content).await
}

/// Shared tail of both the first-attempt and retry paths: emit the
/// `activity` start signal, invoke the reply dispatcher, persist and fan
/// out each delivered payload, then finalize the message row's
/// `streamingState` and emit the `activity` stop signal (spec §4.6
/// steps 7-8).
async fn run_dispatch_and_finalize(
    deps: &IngestionDeps,
    session: &Arc<Session>,
    client_id: &str,
    session_key: &str,
    stream_kind: StreamKind,
    server_event_id: &str,
    content: &str,
) -> anyhow::Result<()> {
    let now_ms = db::epoch_ms();
    fanout::deliver_activity(&deps.sessions, &session.user_id, session_key, server_event_id, true).await;

    let mut delivered_any = false;
    let mut queued_any = false;
    let mut stream = deps.dispatcher.dispatch(InboundContext {
        user_id: session.user_id.clone(),
        device_id: session.device_id.clone(),
        session_key: session_key.to_owned(),
        stream_kind,
        client_message_id: client_id.to_owned(),
        server_event_id: server_event_id.to_owned(),
        content: content.to_owned(),
    });

    while let Some(next) = stream.next().await {
        match next {
            Ok(DeliveredPayload::Reply { content, media_urls }) => {
                match persist_reply(deps, session, session_key, &content, &media_urls, now_ms).await {
                    Ok(()) => delivered_any = true,
                    Err(e) => warn!(error = %e, "failed to persist dispatcher reply"),
                }
            }
            Ok(DeliveredPayload::QueuedFollowup) => {
                queued_any = true;
            }
            Err(e) => {
                warn!(error = %e, "reply dispatcher failed");
            }
        }
    }

    // Spec §4.6 step 8: Finalized if any reply landed, Queued if a
    // follow-up was observed instead, Failed otherwise (no delivery and
    // no queued signal — including a dispatcher that replied with
    // nothing at all).
    let final_state = if delivered_any {
        StreamingState::Finalized
    } else if queued_any {
        StreamingState::Queued
    } else {
        StreamingState::Failed
    };

    db::messages::set_streaming_state(&deps.pool, &session.device_id, client_id, final_state).await?;
    if final_state == StreamingState::Failed {
        session.send(ServerMessage::Error {
            code: ErrorCode::ServerError.as_str().to_owned(),
            message: "no reply was produced for this message".to_owned(),
            message_id: Some(client_id.to_owned()),
        });
    }
    fanout::deliver_activity(&deps.sessions, &session.user_id, session_key, server_event_id, false).await;

    Ok(())
}

/// Persist and fan out one assistant reply payload, fetching and
/// re-encoding any referenced media first (spec §4.6 step 7).
async fn persist_reply(
    deps: &IngestionDeps,
    session: &Arc<Session>,
    session_key: &str,
    content: &str,
    media_urls: &[String],
    now_ms: i64,
) -> anyhow::Result<()> {
    let mut attachments = Vec::with_capacity(media_urls.len());
    for url in media_urls {
        let fetched = crate::media_fetch::fetch_and_optimize(url, deps.max_upload_bytes, deps.media_fetch_timeout).await?;
        let asset_id = assets::store_new(&deps.assets_dir, &deps.tmp_dir, &fetched.bytes).await?;
        let mut tx = deps.pool.begin().await?;
        db::assets::insert(&mut tx, &asset_id, &session.user_id, &fetched.mime_type, fetched.bytes.len() as i64, &session.device_id, now_ms).await?;
        tx.commit().await?;
        attachments.push(Attachment::Asset { asset_id });
    }

    let reply_id = ids::new_server_event_id();
    let payload = MessagePayload {
        id: reply_id.clone(),
        role: "assistant".to_owned(),
        session_key: session_key.to_owned(),
        timestamp: db::epoch_ms(),
        streaming: false,
        content: content.to_owned(),
        attachments,
        device_id: None,
    };
    let payload_json = payload.to_payload_json()?;

    let mut tx = deps.pool.begin().await?;
    db::events::append(&mut tx, &reply_id, &session.user_id, session_key, "message", None, &payload_json).await?;
    tx.commit().await?;

    fanout::deliver_message(&deps.sessions, &session.user_id, &payload, &deps.admin_global_stream_key).await;
    Ok(())
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn server_error(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::ServerError, e.to_string())
}
