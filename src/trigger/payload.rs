//! Body parsing and provider handshake detection.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("empty request body")]
    EmptyBody,

    #[error("malformed body: {0}")]
    Malformed(String),

    #[error("form body has no payload field")]
    MissingPayload,

    #[error("payload is an empty object")]
    EmptyPayload,
}

/// Parse an inbound body into a payload value. Form-encoded bodies must
/// carry their JSON in a `payload` field; everything else is treated as raw
/// JSON. Empty bodies and empty JSON objects fail closed.
pub fn parse_body(body: &[u8], content_type: Option<&str>) -> Result<Value, PayloadError> {
    if body.is_empty() {
        return Err(PayloadError::EmptyBody);
    }

    let is_form = content_type
        .map(|ct| ct.contains("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    let value = if is_form {
        let payload = url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .ok_or(PayloadError::MissingPayload)?;
        serde_json::from_str(&payload).map_err(|e| PayloadError::Malformed(e.to_string()))?
    } else {
        serde_json::from_slice(body).map_err(|e| PayloadError::Malformed(e.to_string()))?
    };

    if matches!(&value, Value::Object(map) if map.is_empty()) {
        return Err(PayloadError::EmptyPayload);
    }
    Ok(value)
}

/// Provider handshake requests are answered directly, before any trigger
/// resolution or authentication.
pub fn challenge_response(payload: &Value) -> Option<Value> {
    let challenge = payload.get("challenge")?;
    let is_verification = payload
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| t == "url_verification")
        .unwrap_or(true);
    if is_verification {
        Some(serde_json::json!({ "challenge": challenge }))
    } else {
        None
    }
}
