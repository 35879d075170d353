// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Attachment policy (spec §4.7): which MIME types may be inlined, which
//! must be asset references, and which stream kinds accept which.

use base64::Engine;

use crate::error::{ApiError, ErrorCode};
use crate::ids::StreamKeyParts;
use crate::transport::ws_msg::Attachment;

/// Inline image MIME types, counted against `maxInlineBytes`.
const INLINE_IMAGE_MIME_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/gif", "image/webp", "image/heic"];

pub const TERMINAL_SESSION_MIME: &str = "application/vnd.clawline.terminal-session+json";
pub const INTERACTIVE_HTML_MIME: &str = "application/vnd.clawline.interactive-html+json";

const INLINE_DOCUMENT_MIME_TYPES: &[&str] = &[TERMINAL_SESSION_MIME, INTERACTIVE_HTML_MIME];

/// A normalised attachment after policy checks: either bytes to persist
/// as a new owned asset, or a reference to an asset that must already be
/// owned by the session's user.
pub enum NormalizedAttachment {
    NewAsset { mime_type: String, bytes: Vec<u8> },
    ExistingAsset { asset_id: String },
}

/// Validate and classify one inbound attachment (spec §4.6 step 3, §4.7).
///
/// `stream` identifies the resolved target stream so terminal-session /
/// interactive-html documents can be confined to per-user streams.
pub fn normalize(
    attachment: &Attachment,
    stream: &StreamKeyParts,
    max_inline_bytes: usize,
) -> Result<NormalizedAttachment, ApiError> {
    match attachment {
        Attachment::Image { mime_type, data } => {
            if !INLINE_IMAGE_MIME_TYPES.contains(&mime_type.as_str()) {
                return Err(ApiError::new(ErrorCode::InvalidMessage, format!("unsupported image mime type: {mime_type}")));
            }
            let bytes = decode_inline(data, max_inline_bytes)?;
            Ok(NormalizedAttachment::NewAsset { mime_type: mime_type.clone(), bytes })
        }
        Attachment::Document { mime_type, data } => {
            if !INLINE_DOCUMENT_MIME_TYPES.contains(&mime_type.as_str()) {
                return Err(ApiError::new(ErrorCode::InvalidMessage, format!("unsupported document mime type: {mime_type}")));
            }
            if is_terminal_or_interactive(mime_type) && !is_per_user_clawline_stream(stream) {
                return Err(ApiError::new(
                    ErrorCode::Forbidden,
                    "terminal-session/interactive-html documents may only target a per-user stream",
                ));
            }
            let bytes = decode_inline(data, max_inline_bytes)?;
            Ok(NormalizedAttachment::NewAsset { mime_type: mime_type.clone(), bytes })
        }
        Attachment::Asset { asset_id } => {
            if !crate::ids::is_valid_asset_id(asset_id) {
                return Err(ApiError::new(ErrorCode::AssetNotFound, "malformed asset id"));
            }
            Ok(NormalizedAttachment::ExistingAsset { asset_id: asset_id.clone() })
        }
    }
}

/// A stable, content-derived digest of a client's raw attachment list,
/// used to detect whether a retransmitted `clientId` carries the exact
/// same attachments (spec §3 `UserMessageRecord.attachmentsHash`) before
/// any asset ids are minted. Order-sensitive: retries are expected to
/// resend attachments in the same order they were first sent in.
pub fn hash_attachments(attachments: &[Attachment]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for attachment in attachments {
        match attachment {
            Attachment::Image { mime_type, data } => {
                hasher.update(b"image|");
                hasher.update(mime_type.as_bytes());
                hasher.update(b"|");
                hasher.update(data.as_bytes());
            }
            Attachment::Document { mime_type, data } => {
                hasher.update(b"document|");
                hasher.update(mime_type.as_bytes());
                hasher.update(b"|");
                hasher.update(data.as_bytes());
            }
            Attachment::Asset { asset_id } => {
                hasher.update(b"asset|");
                hasher.update(asset_id.as_bytes());
            }
        }
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

fn is_terminal_or_interactive(mime_type: &str) -> bool {
    mime_type == TERMINAL_SESSION_MIME || mime_type == INTERACTIVE_HTML_MIME
}

/// Per-user clawline streams are `main`, `dm`, or a custom `s_xxxxxxxx`
/// suffix — i.e. anything other than the shared admin global stream.
fn is_per_user_clawline_stream(stream: &StreamKeyParts) -> bool {
    stream.suffix == "main" || stream.suffix == "dm" || stream.suffix.starts_with("s_")
}

fn decode_inline(data: &str, max_inline_bytes: usize) -> Result<Vec<u8>, ApiError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|_| ApiError::new(ErrorCode::InvalidMessage, "attachment data is not valid base64"))?;
    if bytes.len() > max_inline_bytes {
        return Err(ApiError::new(ErrorCode::PayloadTooLarge, "attachment exceeds maxInlineBytes"));
    }
    Ok(bytes)
}

/// Strip terminal-session document attachments for a session lacking the
/// `terminal_bubbles_v1` feature (spec §4.8). Returns `None` if stripping
/// empties the attachment list (wire format: the field becomes absent).
pub fn strip_unsupported_attachments(
    attachments: Vec<Attachment>,
    has_terminal_bubbles: bool,
) -> Vec<Attachment> {
    if has_terminal_bubbles {
        return attachments;
    }
    attachments
        .into_iter()
        .filter(|a| !matches!(a, Attachment::Document { mime_type, .. } if mime_type == TERMINAL_SESSION_MIME))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_stream() -> StreamKeyParts {
        StreamKeyParts { agent_id: "main".to_owned(), user_id: "flynn".to_owned(), suffix: "main".to_owned() }
    }

    fn admin_stream() -> StreamKeyParts {
        StreamKeyParts { agent_id: "main".to_owned(), user_id: "admin".to_owned(), suffix: "global_dm".to_owned() }
    }

    #[test]
    fn rejects_non_allowlisted_image_mime() {
        let attachment = Attachment::Image { mime_type: "image/svg+xml".to_owned(), data: "".to_owned() };
        let result = normalize(&attachment, &main_stream(), 1024);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_oversized_inline_payload() {
        let data = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 2048]);
        let attachment = Attachment::Image { mime_type: "image/png".to_owned(), data };
        let result = normalize(&attachment, &main_stream(), 1024);
        assert!(matches!(result, Err(e) if e.code == ErrorCode::PayloadTooLarge));
    }

    #[test]
    fn terminal_session_document_allowed_on_per_user_stream() {
        let data = base64::engine::general_purpose::STANDARD.encode(b"{}");
        let attachment = Attachment::Document { mime_type: TERMINAL_SESSION_MIME.to_owned(), data };
        let result = normalize(&attachment, &main_stream(), 1024);
        assert!(result.is_ok());
    }

    #[test]
    fn terminal_session_document_rejected_on_admin_stream() {
        let data = base64::engine::general_purpose::STANDARD.encode(b"{}");
        let attachment = Attachment::Document { mime_type: TERMINAL_SESSION_MIME.to_owned(), data };
        let result = normalize(&attachment, &admin_stream(), 1024);
        assert!(matches!(result, Err(e) if e.code == ErrorCode::Forbidden));
    }

    #[test]
    fn asset_reference_requires_well_formed_id() {
        let attachment = Attachment::Asset { asset_id: "not-an-asset-id".to_owned() };
        let result = normalize(&attachment, &main_stream(), 1024);
        assert!(matches!(result, Err(e) if e.code == ErrorCode::AssetNotFound));
    }

    #[test]
    fn strip_unsupported_attachments_removes_terminal_session_docs() {
        let data = base64::engine::general_purpose::STANDARD.encode(b"{}");
        let attachments = vec![
            Attachment::Document { mime_type: TERMINAL_SESSION_MIME.to_owned(), data },
            Attachment::Asset { asset_id: "a_00000000-0000-4000-8000-000000000001".to_owned() },
        ];
        let stripped = strip_unsupported_attachments(attachments, false);
        assert_eq!(stripped.len(), 1);
    }
}
