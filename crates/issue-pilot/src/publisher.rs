//! Publisher: git branch/commit/push, then a pull request on the tracker.
//!
//! Uses plain `git` subprocesses, no shell, so branch names and commit
//! messages reach git as literal arguments. Each step must succeed before the
//! next one runs; the first failure aborts the sequence and is reported with
//! its step. Nothing here is retried.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::GitSettings;
use crate::errors::{PilotError, PublishStep};
use crate::plan::ChangePlan;
use crate::tracker::IssueTracker;

/// The version-control primitives the publish sequence needs.
pub trait Vcs: Send + Sync {
    fn configure_identity(&self, name: &str, email: &str) -> Result<()>;
    /// Create `branch` from the current tree state and switch to it.
    fn create_branch(&self, branch: &str) -> Result<()>;
    fn stage_all(&self) -> Result<()>;
    fn commit(&self, message: &str) -> Result<()>;
    /// Push `branch` to `remote`, creating it there and setting upstream.
    fn push(&self, remote: &str, branch: &str) -> Result<()>;
}

/// `git` CLI bridge rooted at a working tree.
pub struct GitCli {
    repo_root: PathBuf,
}

impl GitCli {
    pub fn new(repo_root: impl AsRef<Path>) -> Result<Self> {
        let repo_root = repo_root.as_ref().to_path_buf();

        let check = Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(&repo_root)
            .output()
            .context("Failed to check git repo")?;
        if !check.status.success() {
            bail!("Not a git repository: {}", repo_root.display());
        }

        Ok(Self { repo_root })
    }

    fn run_git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "git {} failed ({}): {}",
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Vcs for GitCli {
    fn configure_identity(&self, name: &str, email: &str) -> Result<()> {
        self.run_git(&["config", "user.name", name])?;
        self.run_git(&["config", "user.email", email])?;
        Ok(())
    }

    fn create_branch(&self, branch: &str) -> Result<()> {
        self.run_git(&["checkout", "-b", branch])?;
        Ok(())
    }

    fn stage_all(&self) -> Result<()> {
        self.run_git(&["add", "-A"])?;
        Ok(())
    }

    fn commit(&self, message: &str) -> Result<()> {
        self.run_git(&["commit", "-m", message])?;
        Ok(())
    }

    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_git(&["push", "-u", remote, branch])?;
        Ok(())
    }
}

/// Turns an applied plan into a reviewable pull request.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// Returns the pull request URL.
    async fn publish(&self, plan: &ChangePlan) -> Result<String, PilotError>;
}

/// Drives a [`Vcs`] and then the tracker's pull request endpoint.
pub struct Publisher<'a> {
    vcs: Box<dyn Vcs + 'a>,
    tracker: &'a dyn IssueTracker,
    git: GitSettings,
}

impl<'a> Publisher<'a> {
    pub fn new(vcs: Box<dyn Vcs + 'a>, tracker: &'a dyn IssueTracker, git: GitSettings) -> Self {
        Self { vcs, tracker, git }
    }

    fn step(&self, step: PublishStep, result: Result<()>) -> Result<(), PilotError> {
        match result {
            Ok(()) => {
                debug!(%step, "Publish step done");
                Ok(())
            }
            Err(e) => Err(PilotError::publish(step, format!("{e:#}"))),
        }
    }
}

#[async_trait]
impl<'a> ChangePublisher for Publisher<'a> {
    async fn publish(&self, plan: &ChangePlan) -> Result<String, PilotError> {
        let branch = plan.branch_name.as_str();

        self.step(
            PublishStep::ConfigureIdentity,
            self.vcs
                .configure_identity(&self.git.user_name, &self.git.user_email),
        )?;
        self.step(PublishStep::CreateBranch, self.vcs.create_branch(branch))?;
        self.step(PublishStep::Stage, self.vcs.stage_all())?;
        self.step(PublishStep::Commit, self.vcs.commit(&plan.commit_message))?;
        self.step(PublishStep::Push, self.vcs.push(&self.git.remote, branch))?;

        let url = self
            .tracker
            .open_request(branch, &plan.request_title, &plan.request_body)
            .await?;
        info!(branch, url = %url, "Opened pull request");
        Ok(url)
    }
}
