//! Model client: one structured prompt in, one typed `ChangePlan` out.
//!
//! Retry policy: only 429 and 5xx are retried, because those mean the provider
//! never produced an answer. A 2xx whose text is not a valid plan is NOT
//! retried: the call already succeeded (and was billed), and a structurally
//! wrong answer rarely fixes itself.
//!
//! Delay before retry `n` (1-based) is `min(max_delay, 2^n s)` plus uniform
//! jitter in `[0, max_jitter)`. No sleep follows the final attempt.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{ModelSettings, MODEL_TIMEOUT};
use crate::errors::PilotError;
use crate::plan::ChangePlan;
use crate::prompts::build_plan_prompt;
use crate::tracker::WorkItem;

/// Longest slice of a provider error body that gets logged.
const LOGGED_BODY_LIMIT: usize = 1000;

/// Anything that can turn a work item into a change plan.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate_plan(&self, item: &WorkItem) -> Result<ChangePlan, PilotError>;
}

/// Raw HTTP outcome of one model call.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends one request payload to the provider. Implementations do not retry.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn send(&self, payload: &Value) -> Result<TransportResponse, PilotError>;
}

/// `POST {api_url}/v1/responses` with bearer auth.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(settings: &ModelSettings) -> Result<Self, PilotError> {
        let http = reqwest::Client::builder()
            .timeout(MODEL_TIMEOUT)
            .connect_timeout(MODEL_TIMEOUT)
            .build()
            .map_err(|e| PilotError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: format!("{}/v1/responses", settings.api_url),
            token: settings.token.clone(),
        })
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn send(&self, payload: &Value) -> Result<TransportResponse, PilotError> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|e| PilotError::ModelRequest(format!("request not delivered: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PilotError::ModelRequest(format!("cannot read response body: {e}")))?;
        Ok(TransportResponse { status, body })
    }
}

/// Exponential backoff budget for retryable statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            max_delay: settings.max_backoff,
            max_jitter: settings.max_jitter,
        }
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = Duration::from_secs(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        exp.min(self.max_delay)
    }

    /// Full delay with an explicit jitter, clamped below `max_jitter`.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            jitter.min(self.max_jitter.saturating_sub(Duration::from_millis(1)))
        };
        self.base_delay(attempt) + jitter
    }

    /// Uniform sample in `[0, max_jitter)`.
    pub fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    Success,
    Retryable,
    Rejected,
}

fn classify(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 | 500..=599 => StatusClass::Retryable,
        _ => StatusClass::Rejected,
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesPayload {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

/// Concatenate every `output_text` fragment of a Responses API body, in order.
pub fn extract_output_text(body: &str) -> Result<String, PilotError> {
    let payload: ResponsesPayload = serde_json::from_str(body)
        .map_err(|e| PilotError::ModelPlan(format!("response is not valid JSON: {e}")))?;

    let mut text = String::new();
    for item in &payload.output {
        if item.kind.as_deref() == Some("output_text") {
            text.push_str(item.text.as_deref().unwrap_or_default());
        }
        for block in &item.content {
            if block.kind.as_deref() == Some("output_text") {
                text.push_str(block.text.as_deref().unwrap_or_default());
            }
        }
    }

    if text.trim().is_empty() {
        return Err(PilotError::ModelPlan(
            "response contained no output_text".into(),
        ));
    }
    Ok(text)
}

fn truncate(body: &str, limit: usize) -> &str {
    match body.char_indices().nth(limit) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// Responses API client with backoff.
pub struct ModelClient<T> {
    transport: T,
    model: String,
    repo: String,
    policy: BackoffPolicy,
}

impl<T: ModelTransport> ModelClient<T> {
    pub fn new(
        transport: T,
        model: impl Into<String>,
        repo: impl Into<String>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            model: model.into(),
            repo: repo.into(),
            policy,
        }
    }

    pub fn request_payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "input": [{ "role": "user", "content": prompt }],
            "text": { "format": { "type": "json_object" } },
        })
    }

    /// Submit `payload` until it succeeds, is rejected, or the budget runs out.
    /// Returns the concatenated output text.
    pub async fn request_text(&self, payload: &Value) -> Result<String, PilotError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_status = 0;

        for attempt in 1..=max_attempts {
            let response = self.transport.send(payload).await?;
            match classify(response.status) {
                StatusClass::Success => {
                    debug!(attempt, status = response.status, "Model call succeeded");
                    return extract_output_text(&response.body);
                }
                StatusClass::Rejected => {
                    error!(
                        status = response.status,
                        body = %truncate(&response.body, LOGGED_BODY_LIMIT),
                        "Model request rejected"
                    );
                    return Err(PilotError::ModelRequest(format!(
                        "HTTP {}: {}",
                        response.status,
                        truncate(&response.body, 200)
                    )));
                }
                StatusClass::Retryable => {
                    last_status = response.status;
                    if attempt == max_attempts {
                        break;
                    }
                    let delay = self.policy.delay_for(attempt, self.policy.sample_jitter());
                    warn!(
                        status = response.status,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Model unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(PilotError::ModelUnavailable {
            attempts: max_attempts,
            last_status,
        })
    }
}

#[async_trait]
impl<T: ModelTransport> PlanGenerator for ModelClient<T> {
    async fn generate_plan(&self, item: &WorkItem) -> Result<ChangePlan, PilotError> {
        let prompt = build_plan_prompt(&self.repo, item);
        let payload = self.request_payload(&prompt);
        info!(issue = item.id, model = %self.model, "Requesting change plan");
        let text = self.request_text(&payload).await?;
        let plan = ChangePlan::parse(&text)?;
        info!(
            issue = item.id,
            branch = %plan.branch_name,
            files = plan.changes.len(),
            "Received change plan"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::test_support::{plan_response, work_item, ScriptedTransport};
    use tokio::time::Instant;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 8,
            max_delay: Duration::from_secs(90),
            max_jitter: Duration::from_secs(2),
        }
    }

    fn client(transport: ScriptedTransport) -> ModelClient<ScriptedTransport> {
        ModelClient::new(transport, "gpt-test", "acme/widgets", policy())
    }

    #[test]
    fn base_delay_doubles_then_caps() {
        let p = policy();
        let delays: Vec<u64> = (1..=8).map(|a| p.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 90, 90]);
        assert_eq!(p.base_delay(200), Duration::from_secs(90));
    }

    #[test]
    fn every_delay_stays_within_cap_plus_jitter() {
        let p = policy();
        for attempt in 1..=8 {
            for _ in 0..50 {
                let delay = p.delay_for(attempt, p.sample_jitter());
                assert!(delay >= p.base_delay(attempt));
                assert!(delay < Duration::from_secs(92), "{delay:?}");
            }
        }
        assert!(p.delay_for(8, Duration::from_secs(10)) < Duration::from_secs(92));
    }

    #[test]
    fn status_classes() {
        assert_eq!(classify(200), StatusClass::Success);
        assert_eq!(classify(429), StatusClass::Retryable);
        assert_eq!(classify(500), StatusClass::Retryable);
        assert_eq!(classify(503), StatusClass::Retryable);
        assert_eq!(classify(400), StatusClass::Rejected);
        assert_eq!(classify(401), StatusClass::Rejected);
        assert_eq!(classify(404), StatusClass::Rejected);
    }

    #[test]
    fn extracts_nested_and_top_level_text_in_order() {
        let body = json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"a\":"},
                    {"type": "refusal", "text": "ignored"}
                ]},
                {"type": "output_text", "text": " 1}"}
            ]
        })
        .to_string();
        assert_eq!(extract_output_text(&body).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn empty_output_is_a_plan_error() {
        let err = extract_output_text(r#"{"output": []}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelPlan);
    }

    #[test]
    fn payload_shape() {
        let c = client(ScriptedTransport::new(vec![]));
        let payload = c.request_payload("do it");
        assert_eq!(payload["model"], "gpt-test");
        assert_eq!(payload["input"][0]["role"], "user");
        assert_eq!(payload["input"][0]["content"], "do it");
        assert_eq!(payload["text"]["format"]["type"], "json_object");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            (429, String::new()),
            (503, String::new()),
            (500, String::new()),
            (200, plan_response("agent/retry")),
        ]);
        let c = client(transport.clone());

        let start = Instant::now();
        let plan = c.generate_plan(&work_item(42, &["agent"])).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(plan.branch_name, "agent/retry");
        assert_eq!(transport.calls(), 4);
        assert!(elapsed >= Duration::from_secs(2 + 4 + 8), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2 + 4 + 8 + 3 * 2), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_reuse_identical_payload() {
        let transport = ScriptedTransport::new(vec![
            (429, String::new()),
            (200, plan_response("agent/same")),
        ]);
        client(transport.clone())
            .generate_plan(&work_item(1, &["agent"]))
            .await
            .unwrap();
        let payloads = transport.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], payloads[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts_without_extra_call() {
        let mut script: Vec<(u16, String)> = (0..8).map(|_| (429, String::new())).collect();
        script.push((200, plan_response("never-reached")));
        let transport = ScriptedTransport::new(script);
        let c = client(transport.clone());

        let start = Instant::now();
        let err = c.generate_plan(&work_item(1, &["agent"])).await.unwrap_err();
        let elapsed = start.elapsed();

        match err {
            PilotError::ModelUnavailable {
                attempts,
                last_status,
            } => {
                assert_eq!(attempts, 8);
                assert_eq!(last_status, 429);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls(), 8);
        // Seven sleeps: 2+4+8+16+32+64+90, each with < 2s jitter.
        assert!(elapsed >= Duration::from_secs(216), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(216 + 7 * 2), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn bad_request_fails_without_retry() {
        let transport = ScriptedTransport::new(vec![
            (400, r#"{"error":{"message":"bad input"}}"#.to_string()),
            (200, plan_response("never-reached")),
        ]);
        let start = Instant::now();
        let err = client(transport.clone())
            .generate_plan(&work_item(1, &["agent"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelRequest);
        assert!(err.to_string().contains("bad input"));
        assert_eq!(transport.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_plan_is_not_retried() {
        let body = json!({
            "output": [{"type": "message", "content": [
                {"type": "output_text", "text": "{\"branch_name\": \"x\"}"}
            ]}]
        })
        .to_string();
        let transport = ScriptedTransport::new(vec![
            (200, body),
            (200, plan_response("never-reached")),
        ]);
        let err = client(transport.clone())
            .generate_plan(&work_item(1, &["agent"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelPlan);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn http_transport_posts_to_responses_endpoint() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .expect(1)
            .mount(&server)
            .await;

        let settings = ModelSettings {
            api_url: server.uri(),
            token: "sk-test".into(),
            model: "gpt-test".into(),
            max_attempts: 1,
            max_backoff: Duration::from_secs(90),
            max_jitter: Duration::ZERO,
        };
        let transport = HttpTransport::new(&settings).unwrap();
        let response = transport.send(&json!({"model": "gpt-test"})).await.unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.body, "slow down");
    }
}
