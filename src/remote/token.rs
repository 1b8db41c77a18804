//! Signed delegation tokens.
//!
//! Short-lived bearer credentials scoped to one bot and its workspace,
//! minted fresh per remote call and never persisted. Compact
//! `header.payload.signature` form, HMAC-SHA256 over the first two parts,
//! base64url without padding.

use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;
const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Tokens expire five minutes after minting.
pub const TOKEN_TTL_SECS: i64 = 300;

const HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub bot_id: String,
    pub scopes: Vec<String>,
    pub workspace: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("audience mismatch")]
    Audience,
}

/// Mints a token scoped to `{bot_id, scopes: ["*"], workspace}`.
pub fn mint(secret: &str, bot_id: &str, workspace: &str, audience: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = TokenClaims {
        bot_id: bot_id.to_string(),
        scopes: vec!["*".to_string()],
        workspace: workspace.to_string(),
        aud: audience.to_string(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };
    sign(secret, &claims)
}

pub fn sign(secret: &str, claims: &TokenClaims) -> String {
    let header = B64.encode(HEADER.as_bytes());
    let payload = B64.encode(serde_json::to_vec(claims).expect("claims serialize"));
    let signing_input = format!("{header}.{payload}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(signing_input.as_bytes());
    let signature = B64.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{signature}")
}

/// Checks signature, expiry and audience, in that order.
pub fn verify(secret: &str, token: &str, audience: &str) -> Result<TokenClaims, TokenError> {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed);
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{header}.{payload}").as_bytes());
    let signature = B64.decode(signature).map_err(|_| TokenError::Malformed)?;
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::BadSignature)?;

    let payload = B64.decode(payload).map_err(|_| TokenError::Malformed)?;
    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }
    if claims.aud != audience {
        return Err(TokenError::Audience);
    }
    Ok(claims)
}
