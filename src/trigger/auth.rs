//! Provider authentication schemes for inbound webhooks.

use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing auth header: {0}")]
    MissingHeader(String),

    #[error("token mismatch")]
    TokenMismatch,

    #[error("invalid signature")]
    InvalidSignature,
}

/// Per-trigger authentication configuration, chosen by provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scheme")]
pub enum TriggerAuth {
    /// No verification; anyone who knows the path may fire the trigger.
    None,
    /// Exact match of a custom header against a configured token.
    HeaderToken { header: String, token: String },
    /// Exact match of `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// HMAC-SHA256 hex signature over the raw body, carried in a header,
    /// with or without the conventional `sha256=` prefix.
    Hmac { header: String, secret: String },
}

impl TriggerAuth {
    /// Verify an inbound request against this scheme. `headers` keys are
    /// lowercased; the signature is computed over the raw, unparsed body.
    pub fn verify(
        &self,
        headers: &IndexMap<String, String>,
        raw_body: &[u8],
    ) -> Result<(), AuthError> {
        match self {
            TriggerAuth::None => Ok(()),
            TriggerAuth::HeaderToken { header, token } => {
                let got = headers
                    .get(&header.to_lowercase())
                    .ok_or_else(|| AuthError::MissingHeader(header.clone()))?;
                if got == token {
                    Ok(())
                } else {
                    Err(AuthError::TokenMismatch)
                }
            }
            TriggerAuth::Bearer { token } => {
                let got = headers
                    .get("authorization")
                    .ok_or_else(|| AuthError::MissingHeader("authorization".into()))?;
                match got.strip_prefix("Bearer ") {
                    Some(bearer) if bearer == token => Ok(()),
                    _ => Err(AuthError::TokenMismatch),
                }
            }
            TriggerAuth::Hmac { header, secret } => {
                let signature = headers
                    .get(&header.to_lowercase())
                    .ok_or_else(|| AuthError::MissingHeader(header.clone()))?;
                verify_hmac(secret, raw_body, signature)
            }
        }
    }
}

fn verify_hmac(secret: &str, raw_body: &[u8], signature: &str) -> Result<(), AuthError> {
    let hex = signature.strip_prefix("sha256=").unwrap_or(signature);
    let expected = decode_hex(hex).ok_or(AuthError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthError::InvalidSignature)?;
    mac.update(raw_body);
    mac.verify_slice(&expected)
        .map_err(|_| AuthError::InvalidSignature)
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    // Attacker-controlled header: decode over bytes, never char boundaries.
    let bytes = s.as_bytes();
    if bytes.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi as u8) << 4 | lo as u8)
        })
        .collect()
}
