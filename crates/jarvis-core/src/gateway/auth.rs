//! Bearer token provisioning and validation.
//!
//! Signed rather than opaque: `POST /api/auth/login` exchanges the shared
//! password for a 7-day-expiry token. No JWT crate is pulled in for this —
//! `sha2`/`hex` are already in the dependency stack, and a single-role,
//! single-secret token doesn't need a claims registry or algorithm
//! negotiation.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::state::GatewayState;

const TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;
const HMAC_BLOCK_SIZE: usize = 64;

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    exp: u64,
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut key_block = [0u8; HMAC_BLOCK_SIZE];
    if key.len() > HMAC_BLOCK_SIZE {
        let digest = Sha256::digest(key);
        key_block[..digest.len()].copy_from_slice(&digest);
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut ipad = [0x36u8; HMAC_BLOCK_SIZE];
    let mut opad = [0x5cu8; HMAC_BLOCK_SIZE];
    for i in 0..HMAC_BLOCK_SIZE {
        ipad[i] ^= key_block[i];
        opad[i] ^= key_block[i];
    }

    let mut inner = Sha256::new();
    inner.update(ipad);
    inner.update(message);
    let inner_digest = inner.finalize();

    let mut outer = Sha256::new();
    outer.update(opad);
    outer.update(inner_digest);
    outer.finalize().into()
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Mint a signed token good for [`TOKEN_TTL_SECS`] from now.
pub fn issue_token(secret: &str) -> String {
    let payload = TokenPayload {
        exp: now_secs() + TOKEN_TTL_SECS,
    };
    let payload_bytes = serde_json::to_vec(&payload).expect("token payload always serializes");
    let sig = hmac_sha256(secret.as_bytes(), &payload_bytes);
    format!("{}.{}", hex::encode(payload_bytes), hex::encode(sig))
}

/// Validate a token's signature and expiry against `secret`.
pub fn verify_token(token: &str, secret: &str) -> bool {
    let Some((payload_hex, sig_hex)) = token.split_once('.') else {
        return false;
    };
    let (Ok(payload_bytes), Ok(sig_bytes)) = (hex::decode(payload_hex), hex::decode(sig_hex)) else {
        return false;
    };
    let expected = hmac_sha256(secret.as_bytes(), &payload_bytes);
    if expected.as_slice() != sig_bytes.as_slice() {
        return false;
    }
    let Ok(payload) = serde_json::from_slice::<TokenPayload>(&payload_bytes) else {
        return false;
    };
    payload.exp >= now_secs()
}

/// Axum middleware: validates `Authorization: Bearer <token>` against the
/// configured JWT secret. Every HTTP route except `/api/health` and
/// `/api/auth/login` is behind this.
pub async fn auth_middleware(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let provided = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if verify_token(token, &state.jwt_secret) => Ok(next.run(request).await),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

/// Handshake-time auth for the real-time transport: the token travels as a
/// `?token=` query parameter on the upgrade request since browsers cannot
/// set arbitrary headers on a WebSocket handshake.
pub fn verify_handshake_token(query: &str, secret: &str) -> bool {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| verify_token(&v, secret))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_against_same_secret() {
        let token = issue_token("s3cr3t");
        assert!(verify_token(&token, "s3cr3t"));
    }

    #[test]
    fn token_rejected_under_wrong_secret() {
        let token = issue_token("s3cr3t");
        assert!(!verify_token(&token, "other"));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = issue_token("s3cr3t");
        let (_, sig) = token.split_once('.').unwrap();
        let forged = format!("{}.{}", hex::encode(b"{\"exp\":99999999999}"), sig);
        assert!(!verify_token(&forged, "s3cr3t"));
    }

    #[test]
    fn malformed_token_is_rejected() {
        assert!(!verify_token("not-a-token", "s3cr3t"));
    }

    #[test]
    fn handshake_token_extracted_from_query_string() {
        let token = issue_token("s3cr3t");
        let query = format!("token={token}&other=1");
        assert!(verify_handshake_token(&query, "s3cr3t"));
    }
}
