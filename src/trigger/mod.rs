//! Webhook trigger dispatch.
//!
//! Inbound provider events are authenticated and normalized here, then
//! enqueued as execution jobs. Provider webhooks are fire-and-forget:
//! only parse, auth, and not-found failures surface as client errors;
//! rate/usage limits and infrastructure failures answer success-shaped so
//! providers never retry-storm us.

pub mod auth;
pub mod dispatcher;
pub mod payload;
pub mod registry;
pub mod token;

pub use auth::TriggerAuth;
pub use dispatcher::TriggerDispatcher;
pub use registry::{MemoryQueue, MemoryTriggerRegistry};
pub use token::TestToken;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriggerError {
    /// A backing service (lookup, limiter, queue) failed.
    #[error("Trigger backend error: {0}")]
    Backend(String),
}

/// A raw inbound event, transport already stripped down to what dispatch
/// needs. Header names are expected lowercased.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub path: String,
    /// Explicit registration id; otherwise resolution goes by path.
    pub webhook_id: Option<String>,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
    pub test_mode: bool,
}

impl TriggerRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// Synchronous answer to the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchResponse {
    pub status: u16,
    pub body: Value,
}

impl DispatchResponse {
    pub fn ok(body: Value) -> Self {
        DispatchResponse { status: 200, body }
    }

    /// Success-shaped no-op: the provider sees 200, nothing executes.
    pub fn soft_ok(message: &str) -> Self {
        DispatchResponse {
            status: 200,
            body: serde_json::json!({ "message": message }),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        DispatchResponse {
            status: 400,
            body: serde_json::json!({ "error": message }),
        }
    }

    pub fn unauthorized(message: &str) -> Self {
        DispatchResponse {
            status: 401,
            body: serde_json::json!({ "error": message }),
        }
    }

    pub fn not_found(message: &str) -> Self {
        DispatchResponse {
            status: 404,
            body: serde_json::json!({ "error": message }),
        }
    }
}

/// A registered webhook trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTrigger {
    pub webhook_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub provider: String,
    pub path: String,
    pub auth: TriggerAuth,
    /// Starter-adjacent block the payload is delivered to.
    pub target_block_id: String,
    pub allow_test: bool,
    /// Whether the deployed version of the workflow is the target.
    pub deployed: bool,
}

/// Normalized job handed to the execution queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub webhook_id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub provider: String,
    pub payload: Value,
    pub headers: IndexMap<String, String>,
    pub path: String,
    pub target_block_id: String,
    pub test_mode: bool,
    pub deployed: bool,
}

/// Resolves trigger registrations.
#[async_trait]
pub trait TriggerLookup: Send + Sync {
    async fn find_by_path(&self, path: &str) -> Result<Option<WebhookTrigger>, TriggerError>;
    async fn find_by_id(&self, webhook_id: &str) -> Result<Option<WebhookTrigger>, TriggerError>;
}

/// Account-level request rate check. `Ok(false)` means the user is at their
/// limit.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, user_id: &str) -> Result<bool, TriggerError>;
}

/// Account-level usage/billing check. `Ok(false)` means the account is over
/// its usage limit.
#[async_trait]
pub trait UsageGate: Send + Sync {
    async fn within_limits(&self, user_id: &str) -> Result<bool, TriggerError>;
}

/// Sink for accepted execution jobs.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    async fn enqueue(&self, job: ExecutionJob) -> Result<(), TriggerError>;
}
