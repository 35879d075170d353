// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token issuance and verification (spec §4.1).
//!
//! A token is `base64url(payload_json) . base64url(hmac_sha256(payload_json))`,
//! signed with a 32-byte local secret generated on first start and persisted
//! with mode 0600.

use std::path::Path;

use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "isAdmin")]
    pub is_admin: bool,
    #[serde(rename = "issuedAt")]
    pub issued_at: i64,
    #[serde(rename = "exp", skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

pub struct TokenSigner {
    key: hmac::Key,
}

#[derive(Debug)]
pub enum VerifyError {
    Malformed,
    BadSignature,
    Expired,
}

impl TokenSigner {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self { key: hmac::Key::new(hmac::HMAC_SHA256, secret) }
    }

    /// Load the local signing secret from `path`, generating and persisting
    /// a fresh 32-byte secret (mode 0600) if it doesn't exist yet.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        let secret = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let generated = generate_secret();
                write_secret_file(path, &generated)?;
                generated
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_secret(&secret))
    }

    pub fn issue(&self, claims: &TokenClaims) -> anyhow::Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let tag = hmac::sign(&self.key, &payload);
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        Ok(format!("{}.{}", engine.encode(&payload), engine.encode(tag.as_ref())))
    }

    /// Verify a token's signature and `exp` claim, returning its claims.
    /// Signature comparison is constant-time (`ring::hmac::verify`).
    pub fn verify(&self, token: &str, now_epoch_secs: i64) -> Result<TokenClaims, VerifyError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(VerifyError::Malformed)?;
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let payload = engine.decode(payload_b64).map_err(|_| VerifyError::Malformed)?;
        let sig = engine.decode(sig_b64).map_err(|_| VerifyError::Malformed)?;

        hmac::verify(&self.key, &payload, &sig).map_err(|_| VerifyError::BadSignature)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| VerifyError::Malformed)?;

        if let Some(exp) = claims.exp {
            if now_epoch_secs >= exp {
                return Err(VerifyError::Expired);
            }
        }

        Ok(claims)
    }
}

fn generate_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(unix)]
fn write_secret_file(path: &Path, secret: &[u8]) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, secret)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, secret: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, secret)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_claims() -> TokenClaims {
        TokenClaims {
            subject: "flynn".to_owned(),
            device_id: "00000000-0000-4000-8000-000000000001".to_owned(),
            is_admin: true,
            issued_at: 1000,
            exp: None,
        }
    }

    #[test]
    fn issue_then_verify_round_trips() {
        let signer = TokenSigner::from_secret(b"0123456789abcdef0123456789abcdef");
        let token = signer.issue(&sample_claims()).expect("issue");
        let claims = signer.verify(&token, 2000).expect("verify");
        assert_eq!(claims.subject, "flynn");
        assert!(claims.is_admin);
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let signer = TokenSigner::from_secret(b"0123456789abcdef0123456789abcdef");
        let token = signer.issue(&sample_claims()).expect("issue");
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(signer.verify(&tampered, 2000), Err(VerifyError::BadSignature)));
    }

    #[test]
    fn verify_enforces_expiry() {
        let signer = TokenSigner::from_secret(b"0123456789abcdef0123456789abcdef");
        let mut claims = sample_claims();
        claims.exp = Some(1500);
        let token = signer.issue(&claims).expect("issue");
        assert!(matches!(signer.verify(&token, 1500), Err(VerifyError::Expired)));
        assert!(signer.verify(&token, 1400).is_ok());
    }

    #[test]
    fn different_secrets_do_not_verify() {
        let signer_a = TokenSigner::from_secret(b"0123456789abcdef0123456789abcdef");
        let signer_b = TokenSigner::from_secret(b"fedcba9876543210fedcba9876543210");
        let token = signer_a.issue(&sample_claims()).expect("issue");
        assert!(matches!(signer_b.verify(&token, 2000), Err(VerifyError::BadSignature)));
    }
}
