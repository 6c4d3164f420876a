//! The trigger dispatch pipeline.

use std::sync::Arc;

use tracing::{info, warn};

use super::payload::{challenge_response, parse_body};
use super::token::TestToken;
use super::{
    DispatchResponse, ExecutionJob, ExecutionQueue, RateLimiter, TriggerRequest, UsageGate,
    WebhookTrigger,
};

/// Header carrying the signed test-mode token.
pub const TEST_TOKEN_HEADER: &str = "x-test-token";

/// Decides synchronously whether an inbound event becomes an execution job.
///
/// The pipeline is ordered and short-circuiting: parse, handshake, resolve,
/// authenticate, rate limit, usage limit, enqueue. Everything from the rate
/// limit onward answers success-shaped on failure.
pub struct TriggerDispatcher {
    lookup: Arc<dyn super::TriggerLookup>,
    rate_limiter: Arc<dyn RateLimiter>,
    usage_gate: Arc<dyn UsageGate>,
    queue: Arc<dyn ExecutionQueue>,
    test_tokens: TestToken,
}

impl TriggerDispatcher {
    pub fn new(
        lookup: Arc<dyn super::TriggerLookup>,
        rate_limiter: Arc<dyn RateLimiter>,
        usage_gate: Arc<dyn UsageGate>,
        queue: Arc<dyn ExecutionQueue>,
        test_tokens: TestToken,
    ) -> Self {
        TriggerDispatcher {
            lookup,
            rate_limiter,
            usage_gate,
            queue,
            test_tokens,
        }
    }

    pub async fn dispatch(&self, request: TriggerRequest) -> DispatchResponse {
        // 1. Parse: fails closed before anything else runs.
        let payload = match parse_body(&request.body, request.content_type()) {
            Ok(payload) => payload,
            Err(e) => return DispatchResponse::bad_request(&e.to_string()),
        };

        // 2. Provider handshake answers immediately.
        if let Some(answer) = challenge_response(&payload) {
            return DispatchResponse::ok(answer);
        }

        // 3. Resolve the trigger registration.
        let trigger = match self.resolve(&request).await {
            Ok(Some(trigger)) => trigger,
            Ok(None) => return DispatchResponse::not_found("no trigger registered"),
            Err(e) => {
                warn!(path = %request.path, error = %e, "trigger lookup failed");
                return DispatchResponse::not_found("no trigger registered");
            }
        };
        if request.test_mode && !trigger.allow_test {
            return DispatchResponse::not_found("trigger does not accept test invocations");
        }
        if !request.test_mode && !trigger.deployed {
            return DispatchResponse::not_found("trigger is not deployed");
        }

        // 4. Authenticate: a valid test token replaces provider auth in test
        // mode, everything else goes through the configured scheme.
        if request.test_mode {
            let Some(token) = request.header(TEST_TOKEN_HEADER) else {
                return DispatchResponse::unauthorized("missing test token");
            };
            if let Err(e) = self.test_tokens.verify(token, &trigger.webhook_id) {
                return DispatchResponse::unauthorized(&e.to_string());
            }
        } else if let Err(e) = trigger.auth.verify(&request.headers, &request.body) {
            return DispatchResponse::unauthorized(&e.to_string());
        }

        // 5. Rate limit: soft failure, never a client error.
        match self.rate_limiter.check(&trigger.user_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(user_id = %trigger.user_id, "trigger dropped: rate limited");
                return DispatchResponse::soft_ok("request received");
            }
            Err(e) => {
                warn!(user_id = %trigger.user_id, error = %e, "rate limiter unavailable");
                return DispatchResponse::soft_ok("request received");
            }
        }

        // 6. Usage limit, skipped for test invocations.
        if !request.test_mode {
            match self.usage_gate.within_limits(&trigger.user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(user_id = %trigger.user_id, "trigger dropped: usage exceeded");
                    return DispatchResponse::soft_ok("request received");
                }
                Err(e) => {
                    warn!(user_id = %trigger.user_id, error = %e, "usage gate unavailable");
                    return DispatchResponse::soft_ok("request received");
                }
            }
        }

        // 7. Enqueue; provider webhooks are fire-and-forget, so a queue
        // failure is logged and answered success-shaped.
        let job = ExecutionJob {
            webhook_id: trigger.webhook_id.clone(),
            workflow_id: trigger.workflow_id.clone(),
            user_id: trigger.user_id.clone(),
            provider: trigger.provider.clone(),
            payload,
            headers: request.headers.clone(),
            path: request.path.clone(),
            target_block_id: trigger.target_block_id.clone(),
            test_mode: request.test_mode,
            deployed: trigger.deployed,
        };
        match self.queue.enqueue(job).await {
            Ok(()) => {
                info!(
                    webhook_id = %trigger.webhook_id,
                    workflow_id = %trigger.workflow_id,
                    "execution enqueued"
                );
                DispatchResponse::ok(serde_json::json!({ "message": "accepted" }))
            }
            Err(e) => {
                warn!(webhook_id = %trigger.webhook_id, error = %e, "enqueue failed");
                DispatchResponse::soft_ok("request received")
            }
        }
    }

    async fn resolve(
        &self,
        request: &TriggerRequest,
    ) -> Result<Option<WebhookTrigger>, super::TriggerError> {
        match &request.webhook_id {
            Some(id) => self.lookup.find_by_id(id).await,
            None => self.lookup.find_by_path(&request.path).await,
        }
    }
}
