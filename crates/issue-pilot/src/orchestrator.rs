//! Orchestration: process at most one issue through select → lock → generate →
//! apply → publish → report.
//!
//! Every failure between taking the lock and opening the pull request is caught
//! once, here: the lock is released, a diagnostic comment is posted, and the
//! original error is returned so the CI job fails visibly. Unlock/comment
//! failures during that unwind are logged and never replace the original error.

use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::applier::ChangeApplier;
use crate::errors::PilotError;
use crate::model::PlanGenerator;
use crate::publisher::ChangePublisher;
use crate::state_machine::{RunState, StateMachine};
use crate::tracker::{IssueTracker, WorkItem};

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No open issue carried the work label without the lock label.
    NoEligibleItem,
    Published { item: u64, url: String },
}

pub fn start_comment(at: chrono::DateTime<Utc>) -> String {
    format!(
        "🤖 Agent picked up this issue at {}.\n\nWorking on it now...",
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

pub fn success_comment(url: &str) -> String {
    format!(
        "✅ Opened PR: {url}\n\nIf you want changes, comment on the PR or this issue and re-run the agent."
    )
}

/// `unlocked` says whether the lock label is known to be gone.
pub fn failure_comment(err: &PilotError, unlocked: bool) -> String {
    let lock_note = if unlocked {
        "The lock label was removed so the issue will be retried on the next run."
    } else {
        "The lock label could NOT be removed; remove it by hand to retry this issue."
    };
    format!(
        "❌ Agent failed:\n\n```\n{}: {}\n```\n\nCheck the CI logs for details. {lock_note}",
        err.kind(),
        err
    )
}

/// Wires the collaborators together for one run.
pub struct Orchestrator<'a> {
    tracker: &'a dyn IssueTracker,
    generator: &'a dyn PlanGenerator,
    applier: &'a ChangeApplier,
    publisher: &'a dyn ChangePublisher,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        tracker: &'a dyn IssueTracker,
        generator: &'a dyn PlanGenerator,
        applier: &'a ChangeApplier,
        publisher: &'a dyn ChangePublisher,
    ) -> Self {
        Self {
            tracker,
            generator,
            applier,
            publisher,
        }
    }

    /// Run once with a fresh state machine and log its summary.
    pub async fn run_once(&self) -> Result<RunOutcome, PilotError> {
        let mut sm = StateMachine::new();
        let result = self.run(&mut sm).await;
        info!(summary = %sm.summary(), "Run finished");
        result
    }

    /// Run once, recording every transition in `sm`.
    pub async fn run(&self, sm: &mut StateMachine) -> Result<RunOutcome, PilotError> {
        enter(sm, RunState::Selecting, None);
        let item = match self.tracker.select_next_eligible().await {
            Ok(Some(item)) => item,
            Ok(None) => {
                info!("No eligible issue to process");
                enter(sm, RunState::Done, Some("no eligible issue"));
                return Ok(RunOutcome::NoEligibleItem);
            }
            Err(e) => {
                error!(error = %e, "Selection failed, nothing was locked");
                return Err(e);
            }
        };
        info!(issue = item.id, title = %item.title, "Selected issue");

        let url = match self.process(sm, &item).await {
            Ok(url) => url,
            Err(e) => {
                if sm.current().holds_lock() {
                    self.unwind(sm, &item, &e).await;
                }
                return Err(e);
            }
        };

        enter(sm, RunState::Reporting, None);
        if let Err(e) = self.tracker.comment(item.id, &success_comment(&url)).await {
            // The pull request exists, so the lock stays; the job still fails.
            error!(issue = item.id, url = %url, error = %e, "Could not post success comment");
            return Err(e);
        }
        enter(sm, RunState::Done, None);
        info!(issue = item.id, url = %url, "Issue published");

        Ok(RunOutcome::Published { item: item.id, url })
    }

    async fn process(&self, sm: &mut StateMachine, item: &WorkItem) -> Result<String, PilotError> {
        enter(sm, RunState::Locked, None);
        self.tracker.lock(item.id).await?;
        self.tracker
            .comment(item.id, &start_comment(Utc::now()))
            .await?;

        enter(sm, RunState::Generating, None);
        let plan = self.generator.generate_plan(item).await?;

        enter(sm, RunState::Applying, Some(&plan.branch_name));
        self.applier.apply(&plan.changes)?;

        enter(sm, RunState::Publishing, Some(&plan.branch_name));
        self.publisher.publish(&plan).await
    }

    async fn unwind(&self, sm: &mut StateMachine, item: &WorkItem, err: &PilotError) {
        let kind = err.kind().to_string();
        if let Err(e) = sm.fail(&kind) {
            warn!(error = %e, "Ignoring illegal state transition");
        }
        error!(issue = item.id, kind = %kind, error = %err, "Run failed, releasing lock");

        let unlocked = match self.tracker.unlock(item.id).await {
            Ok(()) => true,
            Err(e) => {
                error!(issue = item.id, error = %e, "Could not release lock");
                false
            }
        };
        let body = failure_comment(err, unlocked);
        if let Err(e) = self.tracker.comment(item.id, &body).await {
            error!(issue = item.id, error = %e, "Could not post failure comment");
        }
    }
}

fn enter(sm: &mut StateMachine, to: RunState, reason: Option<&str>) {
    if let Err(e) = sm.advance(to, reason) {
        warn!(error = %e, "Ignoring illegal state transition");
    }
}
