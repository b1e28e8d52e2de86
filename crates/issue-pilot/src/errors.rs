//! Run error taxonomy with unwind classification.
//!
//! Every failure a run can hit is represented here. The orchestrator asks
//! `kind()` to decide whether the lock must be released, and the failure
//! comment quotes the kind name so operators can grep for it.
//!
//! ## Kinds
//!
//! | Kind                  | Raised by          | Unwinds lock |
//! |-----------------------|--------------------|--------------|
//! | ConfigurationError    | startup            | no           |
//! | SelectionError        | tracker read       | no           |
//! | ModelUnavailableError | model backoff      | yes          |
//! | ModelRequestError     | model 4xx          | yes          |
//! | ModelPlanError        | plan parsing       | yes          |
//! | ApplyError            | working tree write | yes          |
//! | PublishError          | git / pull request | yes          |
//! | ReportingError        | label / comment    | yes          |

use std::fmt;

use thiserror::Error;

/// Classification used by the orchestrator when a run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Selection,
    ModelUnavailable,
    ModelRequest,
    ModelPlan,
    Apply,
    Publish,
    Reporting,
}

impl ErrorKind {
    /// Whether a failure of this kind happens after the lock is taken and
    /// therefore requires the unlock + failure comment path.
    pub fn unwinds_lock(self) -> bool {
        !matches!(self, Self::Configuration | Self::Selection)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "ConfigurationError"),
            Self::Selection => write!(f, "SelectionError"),
            Self::ModelUnavailable => write!(f, "ModelUnavailableError"),
            Self::ModelRequest => write!(f, "ModelRequestError"),
            Self::ModelPlan => write!(f, "ModelPlanError"),
            Self::Apply => write!(f, "ApplyError"),
            Self::Publish => write!(f, "PublishError"),
            Self::Reporting => write!(f, "ReportingError"),
        }
    }
}

/// The publish sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    ConfigureIdentity,
    CreateBranch,
    Stage,
    Commit,
    Push,
    OpenRequest,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigureIdentity => write!(f, "configure-identity"),
            Self::CreateBranch => write!(f, "create-branch"),
            Self::Stage => write!(f, "stage"),
            Self::Commit => write!(f, "commit"),
            Self::Push => write!(f, "push"),
            Self::OpenRequest => write!(f, "open-request"),
        }
    }
}

/// Unified error type for a pilot run.
#[derive(Debug, Error)]
pub enum PilotError {
    /// Required settings are missing or malformed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The tracker could not be read while selecting work.
    #[error("could not list issues: {0}")]
    Selection(String),

    /// Every attempt hit 429/5xx.
    #[error("model unavailable after {attempts} attempts (last status {last_status})")]
    ModelUnavailable { attempts: u32, last_status: u16 },

    /// Non-retryable rejection, or the request never reached the provider.
    #[error("model request failed: {0}")]
    ModelRequest(String),

    /// The model answered but the answer is not a usable plan.
    #[error("model returned an unusable plan: {0}")]
    ModelPlan(String),

    #[error("could not apply change to `{path}`: {message}")]
    Apply { path: String, message: String },

    #[error("publish failed at {step}: {message}")]
    Publish { step: PublishStep, message: String },

    /// A label or comment call failed.
    #[error("tracker report failed: {0}")]
    Reporting(String),
}

impl PilotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Selection(_) => ErrorKind::Selection,
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::ModelRequest(_) => ErrorKind::ModelRequest,
            Self::ModelPlan(_) => ErrorKind::ModelPlan,
            Self::Apply { .. } => ErrorKind::Apply,
            Self::Publish { .. } => ErrorKind::Publish,
            Self::Reporting(_) => ErrorKind::Reporting,
        }
    }

    /// Build an `Apply` variant conveniently.
    pub fn apply(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Apply {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a `Publish` variant conveniently.
    pub fn publish(step: PublishStep, message: impl Into<String>) -> Self {
        Self::Publish {
            step,
            message: message.into(),
        }
    }
}
