//! Issue tracker bridge: GitHub's REST API behind the `IssueTracker` trait.
//!
//! The tracker is the only durable state this system has. The lock label is
//! advisory: adding it is a plain label POST with no compare-and-swap, so two
//! runs that list issues at the same moment can both pick the same item.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::{TrackerSettings, TRACKER_TIMEOUT};
use crate::errors::{PilotError, PublishStep};

/// A tracker issue, snapshotted once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub labels: BTreeSet<String>,
    /// Pull requests show up in the issues listing too; they are never work.
    pub is_pull_request: bool,
}

impl WorkItem {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }
}

/// The selection rule shared by every tracker implementation: the first item,
/// in tracker order, that is not a pull request, carries `work_label` and
/// lacks `lock_label`.
pub fn pick_eligible<'a, I>(items: I, work_label: &str, lock_label: &str) -> Option<WorkItem>
where
    I: IntoIterator<Item = &'a WorkItem>,
{
    items
        .into_iter()
        .find(|item| {
            !item.is_pull_request && item.has_label(work_label) && !item.has_label(lock_label)
        })
        .cloned()
}

/// Operations the orchestrator and publisher need from an issue tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Oldest open issue eligible for processing. Never mutates the tracker.
    async fn select_next_eligible(&self) -> Result<Option<WorkItem>, PilotError>;

    /// Attach the lock label. Adding a label that is already present is a no-op.
    async fn lock(&self, id: u64) -> Result<(), PilotError>;

    /// Detach the lock label. An already-absent label counts as success.
    async fn unlock(&self, id: u64) -> Result<(), PilotError>;

    async fn comment(&self, id: u64, body: &str) -> Result<(), PilotError>;

    /// Open a pull request from `branch` onto the integration branch and
    /// return its URL.
    async fn open_request(&self, branch: &str, title: &str, body: &str)
        -> Result<String, PilotError>;
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<LabelPayload>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullPayload {
    html_url: String,
}

impl From<IssuePayload> for WorkItem {
    fn from(issue: IssuePayload) -> Self {
        Self {
            id: issue.number,
            title: issue.title,
            description: issue.body.filter(|b| !b.trim().is_empty()),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            is_pull_request: issue.pull_request.is_some(),
        }
    }
}

/// GitHub REST client. Fails fast: no call here is ever retried.
pub struct GitHubTracker {
    http: reqwest::Client,
    settings: TrackerSettings,
}

impl GitHubTracker {
    pub fn new(settings: TrackerSettings) -> Result<Self, PilotError> {
        let http = reqwest::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .connect_timeout(TRACKER_TIMEOUT)
            .user_agent(concat!("issue-pilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PilotError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { http, settings })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.settings.api_url, self.settings.repo, suffix
        )
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.settings.token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Fetch one page of open issues carrying the work label, oldest first.
    pub async fn list_open(&self) -> Result<Vec<WorkItem>, PilotError> {
        let page_size = self.settings.page_size.to_string();
        let response = self
            .authed(self.http.get(self.url("issues")))
            .query(&[
                ("state", "open"),
                ("labels", self.settings.work_label.as_str()),
                ("sort", "created"),
                ("direction", "asc"),
                ("per_page", page_size.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PilotError::Selection(e.to_string()))?;
        let response = ensure_success(response)
            .await
            .map_err(PilotError::Selection)?;
        let issues: Vec<IssuePayload> = response
            .json()
            .await
            .map_err(|e| PilotError::Selection(format!("cannot parse issue list: {e}")))?;
        debug!(count = issues.len(), "Listed open issues");
        Ok(issues.into_iter().map(WorkItem::from).collect())
    }
}

/// Turn a non-2xx response into its status line plus body.
async fn ensure_success(response: Response) -> Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("HTTP {status}: {body}"))
}

#[async_trait]
impl IssueTracker for GitHubTracker {
    async fn select_next_eligible(&self) -> Result<Option<WorkItem>, PilotError> {
        let items = self.list_open().await?;
        Ok(pick_eligible(
            &items,
            &self.settings.work_label,
            &self.settings.lock_label,
        ))
    }

    async fn lock(&self, id: u64) -> Result<(), PilotError> {
        let response = self
            .authed(self.http.post(self.url(&format!("issues/{id}/labels"))))
            .json(&json!({ "labels": [self.settings.lock_label] }))
            .send()
            .await
            .map_err(|e| PilotError::Reporting(format!("lock #{id}: {e}")))?;
        ensure_success(response)
            .await
            .map_err(|e| PilotError::Reporting(format!("lock #{id}: {e}")))?;
        info!(issue = id, label = %self.settings.lock_label, "Locked issue");
        Ok(())
    }

    async fn unlock(&self, id: u64) -> Result<(), PilotError> {
        let url = self.url(&format!(
            "issues/{id}/labels/{}",
            urlencoding::encode(&self.settings.lock_label)
        ));
        let response = self
            .authed(self.http.delete(url))
            .send()
            .await
            .map_err(|e| PilotError::Reporting(format!("unlock #{id}: {e}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(issue = id, "Lock label already absent");
            return Ok(());
        }
        ensure_success(response)
            .await
            .map_err(|e| PilotError::Reporting(format!("unlock #{id}: {e}")))?;
        info!(issue = id, "Unlocked issue");
        Ok(())
    }

    async fn comment(&self, id: u64, body: &str) -> Result<(), PilotError> {
        let response = self
            .authed(self.http.post(self.url(&format!("issues/{id}/comments"))))
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(|e| PilotError::Reporting(format!("comment on #{id}: {e}")))?;
        ensure_success(response)
            .await
            .map_err(|e| PilotError::Reporting(format!("comment on #{id}: {e}")))?;
        Ok(())
    }

    async fn open_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
    ) -> Result<String, PilotError> {
        let fail = |msg: String| PilotError::publish(PublishStep::OpenRequest, msg);
        let response = self
            .authed(self.http.post(self.url("pulls")))
            .json(&json!({
                "title": title,
                "head": branch,
                "base": self.settings.base_branch,
                "body": body,
            }))
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let response = ensure_success(response).await.map_err(fail)?;
        let pull: PullPayload = response
            .json()
            .await
            .map_err(|e| fail(format!("cannot parse pull request response: {e}")))?;
        Ok(pull.html_url)
    }
}
