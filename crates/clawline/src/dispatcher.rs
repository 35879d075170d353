// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The external reply-dispatcher interface (spec §1, §4.6 step 7): the
//! backend agent runtime that turns one inbound message into zero or more
//! delivered reply payloads. Its internals are an external collaborator;
//! this module only documents and type-checks the boundary the ingestion
//! pipeline calls through.

use futures_util::stream::BoxStream;

use crate::db::streams::StreamKind;

/// Everything the dispatcher needs to produce a reply to one inbound
/// message.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub user_id: String,
    pub device_id: String,
    pub session_key: String,
    pub stream_kind: StreamKind,
    pub client_message_id: String,
    pub server_event_id: String,
    pub content: String,
}

/// One delivered reply payload, or a signal that a follow-up is still in
/// flight (spec §4.6 step 8: "a queued follow-up is observed" keeps the
/// message `Queued` instead of `Failed`).
#[derive(Debug, Clone)]
pub enum DeliveredPayload {
    Reply { content: String, media_urls: Vec<String> },
    QueuedFollowup,
}

/// Invoked once per inbound message; returns a lazy stream of delivered
/// payloads (spec: "the dispatcher is a lazy sequence of delivered reply
/// payloads"). A dispatcher error surfaces as an empty stream plus an
/// `Err` on `next()`; the ingestion pipeline treats dispatcher failure as
/// `streamingState=Failed`, without retracting the already-broadcast user
/// event (spec §9 Open Question b).
pub trait ReplyDispatcher: Send + Sync {
    fn dispatch(&self, context: InboundContext) -> BoxStream<'static, anyhow::Result<DeliveredPayload>>;
}

/// A dispatcher that never replies, used where no backend agent runtime is
/// wired up (local smoke tests, the `tests/specs` bootstrap-pair scenario).
pub struct NullDispatcher;

impl ReplyDispatcher for NullDispatcher {
    fn dispatch(&self, _context: InboundContext) -> BoxStream<'static, anyhow::Result<DeliveredPayload>> {
        Box::pin(futures_util::stream::empty())
    }
}
