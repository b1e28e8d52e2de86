//! issue-pilot: one labeled issue in, one pull request out.
//!
//! A single run selects the oldest open issue carrying the work label,
//! locks it with a second label, asks a language model for a whole-file
//! change plan, writes that plan into the working tree, publishes it on a
//! new branch with a pull request, and reports back on the issue. Any
//! failure after the lock releases it and leaves a diagnostic comment.
//!
//! The run is strictly sequential and processes at most one issue.

pub mod applier;
pub mod config;
pub mod errors;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod prompts;
pub mod publisher;
pub mod state_machine;
pub mod tracker;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
