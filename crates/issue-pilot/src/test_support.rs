//! In-memory fakes for the tracker, model, git and publisher seams.
//!
//! Compiled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::{PilotError, PublishStep};
use crate::model::{ModelTransport, PlanGenerator, TransportResponse};
use crate::plan::{ChangePlan, FileChange};
use crate::publisher::{ChangePublisher, Vcs};
use crate::tracker::{pick_eligible, IssueTracker, WorkItem};

pub const WORK_LABEL: &str = "agent";
pub const LOCK_LABEL: &str = "agent-in-progress";

/// Shared, ordered record of calls across several fakes.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(log: &Option<EventLog>, event: String) {
    if let Some(log) = log {
        log.lock().unwrap().push(event);
    }
}

pub fn work_item(id: u64, labels: &[&str]) -> WorkItem {
    WorkItem {
        id,
        title: format!("Issue {id}"),
        description: Some("Add a health check endpoint.".into()),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        is_pull_request: false,
    }
}

pub fn sample_plan(branch: &str) -> ChangePlan {
    ChangePlan {
        branch_name: branch.to_string(),
        changes: vec![FileChange::new(
            "src/health.rs",
            "pub fn healthy() -> bool {\n    true\n}\n",
        )],
        commit_message: "Add health check".into(),
        request_title: "Add health check endpoint".into(),
        request_body: "Adds `healthy()` for the load balancer probe.".into(),
    }
}

/// A Responses API body whose output text is `sample_plan(branch)`.
pub fn plan_response(branch: &str) -> String {
    let text = serde_json::to_string(&sample_plan(branch)).unwrap();
    json!({
        "id": "resp_test",
        "object": "response",
        "status": "completed",
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }]
        }]
    })
    .to_string()
}

// ── Tracker ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackerOp {
    Select,
    Lock,
    Unlock,
    Comment,
    OpenRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedRequest {
    pub branch: String,
    pub title: String,
    pub body: String,
    pub url: String,
}

#[derive(Default)]
struct TrackerState {
    items: Vec<WorkItem>,
    ops: Vec<TrackerOp>,
    comments: Vec<(u64, String)>,
    comment_attempts: usize,
    requests: Vec<OpenedRequest>,
}

/// Issue tracker held in memory, with per-operation fault injection.
pub struct InMemoryTracker {
    state: Mutex<TrackerState>,
    failing: HashSet<TrackerOp>,
    failing_comment: Option<usize>,
    log: Option<EventLog>,
}

impl InMemoryTracker {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                items,
                ..Default::default()
            }),
            failing: HashSet::new(),
            failing_comment: None,
            log: None,
        }
    }

    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// Every call of `op` fails.
    pub fn failing(mut self, op: TrackerOp) -> Self {
        self.failing.insert(op);
        self
    }

    /// Only the `nth` (1-based) comment call fails.
    pub fn failing_comment(mut self, nth: usize) -> Self {
        self.failing_comment = Some(nth);
        self
    }

    pub fn labels(&self, id: u64) -> BTreeSet<String> {
        let state = self.state.lock().unwrap();
        state
            .items
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.labels.clone())
            .unwrap_or_default()
    }

    pub fn has_lock(&self, id: u64) -> bool {
        self.labels(id).contains(LOCK_LABEL)
    }

    pub fn ops(&self) -> Vec<TrackerOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    pub fn comments_on(&self, id: u64) -> Vec<String> {
        self.comments()
            .into_iter()
            .filter(|(issue, _)| *issue == id)
            .map(|(_, body)| body)
            .collect()
    }

    pub fn requests(&self) -> Vec<OpenedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn check(&self, state: &mut TrackerState, op: TrackerOp) -> Result<(), String> {
        state.ops.push(op);
        if self.failing.contains(&op) {
            return Err(format!("injected {op:?} failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn select_next_eligible(&self) -> Result<Option<WorkItem>, PilotError> {
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, TrackerOp::Select)
            .map_err(PilotError::Selection)?;
        Ok(pick_eligible(&state.items, WORK_LABEL, LOCK_LABEL))
    }

    async fn lock(&self, id: u64) -> Result<(), PilotError> {
        record(&self.log, format!("lock #{id}"));
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, TrackerOp::Lock)
            .map_err(PilotError::Reporting)?;
        let item = state
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| PilotError::Reporting(format!("HTTP 404: no issue #{id}")))?;
        item.labels.insert(LOCK_LABEL.to_string());
        Ok(())
    }

    async fn unlock(&self, id: u64) -> Result<(), PilotError> {
        record(&self.log, format!("unlock #{id}"));
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, TrackerOp::Unlock)
            .map_err(PilotError::Reporting)?;
        if let Some(item) = state.items.iter_mut().find(|item| item.id == id) {
            item.labels.remove(LOCK_LABEL);
        }
        Ok(())
    }

    async fn comment(&self, id: u64, body: &str) -> Result<(), PilotError> {
        record(&self.log, format!("comment #{id}"));
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, TrackerOp::Comment)
            .map_err(PilotError::Reporting)?;
        state.comment_attempts += 1;
        if self.failing_comment == Some(state.comment_attempts) {
            return Err(PilotError::Reporting("HTTP 502: injected".into()));
        }
        state.comments.push((id, body.to_string()));
        Ok(())
    }

    async fn open_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String, PilotError> {
        let mut state = self.state.lock().unwrap();
        self.check(&mut state, TrackerOp::OpenRequest)
            .map_err(|e| PilotError::publish(PublishStep::OpenRequest, e))?;
        let url = format!(
            "https://github.test/acme/widgets/pull/{}",
            state.requests.len() + 1
        );
        state.requests.push(OpenedRequest {
            branch: branch.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            url: url.clone(),
        });
        Ok(url)
    }
}

// ── Model ────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    responses: VecDeque<(u16, String)>,
    payloads: Vec<Value>,
}

/// Replays canned `(status, body)` pairs and records every payload sent.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<(u16, String)>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                responses: responses.into(),
                payloads: Vec::new(),
            })),
        }
    }

    pub fn calls(&self) -> usize {
        self.script.lock().unwrap().payloads.len()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.script.lock().unwrap().payloads.clone()
    }
}

#[async_trait]
impl ModelTransport for ScriptedTransport {
    async fn send(&self, payload: &Value) -> Result<TransportResponse, PilotError> {
        let mut script = self.script.lock().unwrap();
        script.payloads.push(payload.clone());
        let (status, body) = script
            .responses
            .pop_front()
            .ok_or_else(|| PilotError::ModelRequest("script exhausted".into()))?;
        Ok(TransportResponse { status, body })
    }
}

/// Returns one prepared plan or error, then refuses further calls.
pub struct StaticGenerator {
    outcome: Mutex<Option<Result<ChangePlan, PilotError>>>,
    calls: Mutex<usize>,
    log: Option<EventLog>,
}

impl StaticGenerator {
    pub fn new(outcome: Result<ChangePlan, PilotError>) -> Self {
        Self {
            outcome: Mutex::new(Some(outcome)),
            calls: Mutex::new(0),
            log: None,
        }
    }

    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl PlanGenerator for StaticGenerator {
    async fn generate_plan(&self, item: &WorkItem) -> Result<ChangePlan, PilotError> {
        record(&self.log, format!("generate #{}", item.id));
        *self.calls.lock().unwrap() += 1;
        self.outcome
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(PilotError::ModelRequest("generator already used".into())))
    }
}

// ── Git / publish ────────────────────────────────────────────────────

/// Records each git primitive; the primitive named in `fail_at` errors.
pub struct RecordingVcs {
    calls: Arc<Mutex<Vec<String>>>,
    fail_at: Option<&'static str>,
}

impl RecordingVcs {
    pub fn succeeding() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_at: None,
        }
    }

    pub fn failing_at(op: &'static str) -> Self {
        Self {
            fail_at: Some(op),
            ..Self::succeeding()
        }
    }

    pub fn calls_handle(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    fn call(&self, op: &'static str, detail: String) -> anyhow::Result<()> {
        let entry = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op} {detail}")
        };
        self.calls.lock().unwrap().push(entry);
        if self.fail_at == Some(op) {
            anyhow::bail!("{op} rejected");
        }
        Ok(())
    }
}

impl Vcs for RecordingVcs {
    fn configure_identity(&self, name: &str, _email: &str) -> anyhow::Result<()> {
        self.call("configure_identity", name.to_string())
    }

    fn create_branch(&self, branch: &str) -> anyhow::Result<()> {
        self.call("create_branch", branch.to_string())
    }

    fn stage_all(&self) -> anyhow::Result<()> {
        self.call("stage_all", String::new())
    }

    fn commit(&self, message: &str) -> anyhow::Result<()> {
        self.call("commit", message.to_string())
    }

    fn push(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        self.call("push", format!("{remote} {branch}"))
    }
}

/// Publisher that skips git entirely.
pub struct StubPublisher {
    outcome: Result<String, (PublishStep, String)>,
    calls: Mutex<usize>,
    log: Option<EventLog>,
}

impl StubPublisher {
    pub fn succeeding(url: &str) -> Self {
        Self {
            outcome: Ok(url.to_string()),
            calls: Mutex::new(0),
            log: None,
        }
    }

    pub fn failing(step: PublishStep, message: &str) -> Self {
        Self {
            outcome: Err((step, message.to_string())),
            calls: Mutex::new(0),
            log: None,
        }
    }

    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ChangePublisher for StubPublisher {
    async fn publish(&self, plan: &ChangePlan) -> Result<String, PilotError> {
        record(&self.log, format!("publish {}", plan.branch_name));
        *self.calls.lock().unwrap() += 1;
        match &self.outcome {
            Ok(url) => Ok(url.clone()),
            Err((step, message)) => Err(PilotError::publish(*step, message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_twice_leaves_one_label() {
        let tracker = InMemoryTracker::new(vec![work_item(42, &[WORK_LABEL])]);
        tracker.lock(42).await.unwrap();
        tracker.lock(42).await.unwrap();
        let locks = tracker.labels(42).iter().filter(|l| *l == LOCK_LABEL).count();
        assert_eq!(locks, 1);
        assert!(tracker.select_next_eligible().await.unwrap().is_none());

        tracker.unlock(42).await.unwrap();
        tracker.unlock(42).await.unwrap();
        assert!(!tracker.has_lock(42));
        assert_eq!(
            tracker.select_next_eligible().await.unwrap().map(|i| i.id),
            Some(42)
        );
    }

    #[test]
    fn plan_response_round_trips_through_the_parser() {
        let body = plan_response("agent/x");
        let text = crate::model::extract_output_text(&body).unwrap();
        assert_eq!(ChangePlan::parse(&text).unwrap(), sample_plan("agent/x"));
    }
}
