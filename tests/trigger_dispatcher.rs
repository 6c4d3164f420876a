//! Dispatcher pipeline behavior against in-memory backends.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use serde_json::json;
use sha2::Sha256;

use blockflow::trigger::dispatcher::TEST_TOKEN_HEADER;
use blockflow::trigger::{
    ExecutionJob, ExecutionQueue, MemoryQueue, MemoryTriggerRegistry, RateLimiter, TestToken,
    TriggerAuth, TriggerDispatcher, TriggerError, TriggerRequest, UsageGate, WebhookTrigger,
};

use common::init_tracing;

struct FixedLimiter {
    allow: bool,
    consulted: AtomicBool,
}

impl FixedLimiter {
    fn new(allow: bool) -> Self {
        FixedLimiter {
            allow,
            consulted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RateLimiter for FixedLimiter {
    async fn check(&self, _user_id: &str) -> Result<bool, TriggerError> {
        self.consulted.store(true, Ordering::SeqCst);
        Ok(self.allow)
    }
}

struct FixedUsage {
    allow: bool,
    consulted: AtomicBool,
}

impl FixedUsage {
    fn new(allow: bool) -> Self {
        FixedUsage {
            allow,
            consulted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl UsageGate for FixedUsage {
    async fn within_limits(&self, _user_id: &str) -> Result<bool, TriggerError> {
        self.consulted.store(true, Ordering::SeqCst);
        Ok(self.allow)
    }
}

struct FailingQueue;

#[async_trait]
impl ExecutionQueue for FailingQueue {
    async fn enqueue(&self, _job: ExecutionJob) -> Result<(), TriggerError> {
        Err(TriggerError::Backend("queue down".into()))
    }
}

fn trigger(auth: TriggerAuth) -> WebhookTrigger {
    WebhookTrigger {
        webhook_id: "wh1".into(),
        workflow_id: "wf1".into(),
        user_id: "u1".into(),
        provider: "github".into(),
        path: "/hooks/gh".into(),
        auth,
        target_block_id: "start".into(),
        allow_test: true,
        deployed: true,
    }
}

struct Harness {
    dispatcher: TriggerDispatcher,
    queue: Arc<MemoryQueue>,
    limiter: Arc<FixedLimiter>,
    usage: Arc<FixedUsage>,
}

fn harness(auth: TriggerAuth, rate_ok: bool, usage_ok: bool) -> Harness {
    let registry = Arc::new(MemoryTriggerRegistry::new());
    registry.register(trigger(auth));
    let queue = Arc::new(MemoryQueue::new());
    let limiter = Arc::new(FixedLimiter::new(rate_ok));
    let usage = Arc::new(FixedUsage::new(usage_ok));
    let dispatcher = TriggerDispatcher::new(
        registry,
        Arc::clone(&limiter) as Arc<dyn RateLimiter>,
        Arc::clone(&usage) as Arc<dyn UsageGate>,
        Arc::clone(&queue) as Arc<dyn ExecutionQueue>,
        TestToken::new("test-secret"),
    );
    Harness {
        dispatcher,
        queue,
        limiter,
        usage,
    }
}

fn request(body: &[u8], headers: &[(&str, &str)]) -> TriggerRequest {
    TriggerRequest {
        path: "/hooks/gh".into(),
        webhook_id: None,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<IndexMap<_, _>>(),
        body: body.to_vec(),
        test_mode: false,
    }
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[tokio::test]
async fn test_happy_path_enqueues_job() {
    init_tracing();
    let h = harness(
        TriggerAuth::HeaderToken {
            header: "X-Secret".into(),
            token: "tok".into(),
        },
        true,
        true,
    );

    let response = h
        .dispatcher
        .dispatch(request(
            br#"{"event":"push"}"#,
            &[("content-type", "application/json"), ("x-secret", "tok")],
        ))
        .await;

    assert_eq!(response.status, 200);
    let jobs = h.queue.drain();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].workflow_id, "wf1");
    assert_eq!(jobs[0].payload, json!({"event": "push"}));
    assert!(!jobs[0].test_mode);
}

#[tokio::test]
async fn test_empty_body_rejected_before_auth_and_limits() {
    init_tracing();
    let h = harness(
        TriggerAuth::Bearer {
            token: "tok".into(),
        },
        true,
        true,
    );

    let response = h.dispatcher.dispatch(request(b"", &[])).await;

    assert_eq!(response.status, 400);
    assert!(h.queue.is_empty());
    assert!(!h.limiter.consulted.load(Ordering::SeqCst));
    assert!(!h.usage.consulted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_form_without_payload_rejected() {
    init_tracing();
    let h = harness(TriggerAuth::None, true, true);
    let response = h
        .dispatcher
        .dispatch(request(
            b"a=1&b=2",
            &[("content-type", "application/x-www-form-urlencoded")],
        ))
        .await;
    assert_eq!(response.status, 400);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_rate_limit_is_soft() {
    init_tracing();
    let h = harness(TriggerAuth::None, false, true);
    let response = h
        .dispatcher
        .dispatch(request(br#"{"event":"push"}"#, &[("content-type", "application/json")]))
        .await;

    // Success-shaped so the provider never retries, but nothing ran.
    assert_eq!(response.status, 200);
    assert_eq!(response.body["message"], json!("request received"));
    assert!(h.queue.is_empty());
    assert!(!h.usage.consulted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_usage_limit_is_soft() {
    init_tracing();
    let h = harness(TriggerAuth::None, true, false);
    let response = h
        .dispatcher
        .dispatch(request(br#"{"event":"push"}"#, &[("content-type", "application/json")]))
        .await;
    assert_eq!(response.status, 200);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    init_tracing();
    let h = harness(TriggerAuth::None, true, true);
    let mut req = request(br#"{"event":"push"}"#, &[("content-type", "application/json")]);
    req.path = "/hooks/unknown".into();
    let response = h.dispatcher.dispatch(req).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_hmac_auth_rejects_tampered_body() {
    init_tracing();
    let h = harness(
        TriggerAuth::Hmac {
            header: "X-Hub-Signature-256".into(),
            secret: "shh".into(),
        },
        true,
        true,
    );

    let body = br#"{"event":"push"}"#;
    let good = format!("sha256={}", sign("shh", body));
    let response = h
        .dispatcher
        .dispatch(request(
            body,
            &[("content-type", "application/json"), ("x-hub-signature-256", &good)],
        ))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(h.queue.drain().len(), 1);

    let bad = format!("sha256={}", sign("wrong", body));
    let response = h
        .dispatcher
        .dispatch(request(
            body,
            &[("content-type", "application/json"), ("x-hub-signature-256", &bad)],
        ))
        .await;
    assert_eq!(response.status, 401);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_challenge_answered_without_dispatch() {
    init_tracing();
    let h = harness(TriggerAuth::Bearer { token: "t".into() }, true, true);
    let response = h
        .dispatcher
        .dispatch(request(
            br#"{"type":"url_verification","challenge":"c123"}"#,
            &[("content-type", "application/json")],
        ))
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"challenge": "c123"}));
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_test_mode_uses_token_and_skips_usage_gate() {
    init_tracing();
    // Usage gate would deny; test mode must never consult it.
    let h = harness(
        TriggerAuth::Bearer {
            token: "prod-token".into(),
        },
        true,
        false,
    );
    let token = TestToken::new("test-secret").issue("wh1", 60);

    let mut req = request(
        br#"{"event":"push"}"#,
        &[("content-type", "application/json")],
    );
    req.test_mode = true;
    req.headers.insert(TEST_TOKEN_HEADER.to_string(), token);

    let response = h.dispatcher.dispatch(req).await;
    assert_eq!(response.status, 200);
    assert!(!h.usage.consulted.load(Ordering::SeqCst));
    let jobs = h.queue.drain();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].test_mode);
}

#[tokio::test]
async fn test_test_mode_without_token_is_401() {
    init_tracing();
    let h = harness(TriggerAuth::None, true, true);
    let mut req = request(br#"{"event":"push"}"#, &[("content-type", "application/json")]);
    req.test_mode = true;
    let response = h.dispatcher.dispatch(req).await;
    assert_eq!(response.status, 401);
}

#[tokio::test]
async fn test_enqueue_failure_degrades_to_soft_success() {
    init_tracing();
    let registry = Arc::new(MemoryTriggerRegistry::new());
    registry.register(trigger(TriggerAuth::None));
    let dispatcher = TriggerDispatcher::new(
        registry,
        Arc::new(FixedLimiter::new(true)),
        Arc::new(FixedUsage::new(true)),
        Arc::new(FailingQueue),
        TestToken::new("test-secret"),
    );

    let response = dispatcher
        .dispatch(request(br#"{"event":"push"}"#, &[("content-type", "application/json")]))
        .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body["message"], json!("request received"));
}
