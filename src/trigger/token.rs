//! Short-lived signed tokens for test-mode trigger invocation.
//!
//! Format: `base64url(claims_json).base64url(hmac_sha256(claims_b64))`, no
//! padding. The claims are typed (`"webhook_test"`) and bound to one webhook
//! id, so a leaked token cannot fire another trigger or outlive its window.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_TYPE: &str = "webhook_test";
const ISSUER: &str = "blockflow";
const AUDIENCE: &str = "trigger";

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,

    #[error("bad signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("claim mismatch: {0}")]
    ClaimMismatch(&'static str),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    typ: String,
    webhook_id: String,
    iss: String,
    aud: String,
    exp: i64,
}

/// Issues and verifies test-mode tokens with one shared secret.
pub struct TestToken {
    secret: String,
}

impl TestToken {
    pub fn new(secret: impl Into<String>) -> Self {
        TestToken {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, webhook_id: &str, ttl_secs: i64) -> String {
        let claims = Claims {
            typ: TOKEN_TYPE.to_string(),
            webhook_id: webhook_id.to_string(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            exp: Utc::now().timestamp() + ttl_secs,
        };
        // Claims struct always serializes.
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let claims_b64 = URL_SAFE_NO_PAD.encode(json);
        let sig_b64 = URL_SAFE_NO_PAD.encode(self.sign(claims_b64.as_bytes()));
        format!("{}.{}", claims_b64, sig_b64)
    }

    pub fn verify(&self, token: &str, webhook_id: &str) -> Result<(), TokenError> {
        let (claims_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| TokenError::BadSignature)?;
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

        if claims.typ != TOKEN_TYPE {
            return Err(TokenError::ClaimMismatch("typ"));
        }
        if claims.iss != ISSUER {
            return Err(TokenError::ClaimMismatch("iss"));
        }
        if claims.aud != AUDIENCE {
            return Err(TokenError::ClaimMismatch("aud"));
        }
        if claims.webhook_id != webhook_id {
            return Err(TokenError::ClaimMismatch("webhook_id"));
        }
        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(())
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
