//! Run state machine: explicit states and legal transition guards.
//!
//! Gives the orchestrator a typed state model so that:
//! 1. Every state transition is auditable and logged.
//! 2. Illegal transitions are rejected by `advance()`.
//! 3. The run summary shows exactly which states were visited.

use std::fmt;
use std::time::Instant;

/// The set of run states.
///
/// Every run starts at `Idle` and terminates at either `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    /// Listing the tracker for the next eligible issue.
    Selecting,
    /// Lock label attached and start notice posted.
    Locked,
    /// Waiting on the model for a change plan.
    Generating,
    /// Writing plan changes into the working tree.
    Applying,
    /// Branch, commit, push, pull request.
    Publishing,
    /// Posting the success comment.
    Reporting,
    /// Terminal: published, or nothing to do.
    Done,
    /// Terminal: lock released, failure comment posted.
    Failed,
}

impl RunState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States from which a failure must unwind the lock.
    pub fn holds_lock(self) -> bool {
        matches!(
            self,
            Self::Locked | Self::Generating | Self::Applying | Self::Publishing
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Selecting => write!(f, "Selecting"),
            Self::Locked => write!(f, "Locked"),
            Self::Generating => write!(f, "Generating"),
            Self::Applying => write!(f, "Applying"),
            Self::Publishing => write!(f, "Publishing"),
            Self::Reporting => write!(f, "Reporting"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Legal transitions between run states.
///
/// ```text
/// Idle → Selecting
/// Selecting → Locked | Done (nothing eligible)
/// Locked → Generating | Failed
/// Generating → Applying | Failed
/// Applying → Publishing | Failed
/// Publishing → Reporting | Failed
/// Reporting → Done
/// ```
fn is_legal_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;

    if to == Failed {
        return from.holds_lock();
    }

    matches!(
        (from, to),
        (Idle, Selecting)
            | (Selecting, Locked)
            | (Selecting, Done)
            | (Locked, Generating)
            | (Generating, Applying)
            | (Applying, Publishing)
            | (Publishing, Reporting)
            | (Reporting, Done)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone)]
struct TransitionRecord {
    to: RunState,
    reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: RunState,
    pub to: RunState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current state, enforces legal transitions, and keeps the
/// full transition log for the run summary.
pub struct StateMachine {
    current: RunState,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: RunState::Idle,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn advance(&mut self, to: RunState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            to,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "State transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed`. Legal only while the lock is held.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(RunState::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    /// The visited states, starting with `Idle`.
    pub fn path(&self) -> Vec<RunState> {
        std::iter::once(RunState::Idle)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }

    /// One-line history, e.g. `Idle → Done (12ms, 2 transitions) [Selecting → Done (no eligible issue)]`.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self
            .transitions
            .iter()
            .map(|t| match &t.reason {
                Some(reason) => format!("{} ({reason})", t.to),
                None => t.to.to_string(),
            })
            .collect();
        let mut summary = format!(
            "{} → {} ({}ms, {} transitions)",
            RunState::Idle,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            summary.push_str(&format!(" [{}]", states.join(" → ")));
        }
        summary
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(state: RunState) -> StateMachine {
        StateMachine {
            current: state,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), RunState::Idle);
        assert!(!sm.is_terminal());
        assert_eq!(sm.path(), vec![RunState::Idle]);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut sm = StateMachine::new();
        for state in [
            RunState::Selecting,
            RunState::Locked,
            RunState::Generating,
            RunState::Applying,
            RunState::Publishing,
            RunState::Reporting,
            RunState::Done,
        ] {
            sm.advance(state, None).unwrap();
        }
        assert!(sm.is_terminal());
        assert_eq!(sm.path().len(), 8);
        assert_eq!(sm.path().first(), Some(&RunState::Idle));
        assert_eq!(sm.path().last(), Some(&RunState::Done));
    }

    #[test]
    fn test_nothing_eligible_ends_cleanly() {
        let mut sm = StateMachine::new();
        sm.advance(RunState::Selecting, None).unwrap();
        sm.advance(RunState::Done, Some("no eligible issue")).unwrap();
        assert!(sm.is_terminal());
    }

    #[test]
    fn test_failure_only_while_lock_held() {
        for state in [
            RunState::Locked,
            RunState::Generating,
            RunState::Applying,
            RunState::Publishing,
        ] {
            let mut sm = at(state);
            assert!(sm.fail("boom").is_ok(), "{state} should fail");
            assert_eq!(sm.current(), RunState::Failed);
        }
        for state in [
            RunState::Idle,
            RunState::Selecting,
            RunState::Reporting,
            RunState::Done,
            RunState::Failed,
        ] {
            assert!(at(state).fail("boom").is_err(), "{state} must not fail");
        }
    }

    #[test]
    fn test_cannot_skip_generation() {
        let mut sm = at(RunState::Locked);
        let err = sm.advance(RunState::Applying, None).unwrap_err();
        assert_eq!(err.from, RunState::Locked);
        assert_eq!(err.to, RunState::Applying);
        assert_eq!(err.to_string(), "Illegal state transition: Locked → Applying");
    }

    #[test]
    fn test_cannot_transition_from_terminal() {
        let mut sm = at(RunState::Done);
        assert!(sm.advance(RunState::Selecting, None).is_err());
    }

    #[test]
    fn test_summary_carries_reasons() {
        let mut sm = StateMachine::new();
        sm.advance(RunState::Selecting, None).unwrap();
        sm.advance(RunState::Done, Some("no eligible issue")).unwrap();
        let summary = sm.summary();
        assert!(
            summary.ends_with("[Selecting → Done (no eligible issue)]"),
            "{summary}"
        );
    }

    #[test]
    fn test_summary() {
        let mut sm = at(RunState::Publishing);
        sm.fail("push rejected").unwrap();
        let summary = sm.summary();
        assert!(summary.contains("Failed"));
        assert!(summary.contains("1 transitions"));
    }
}
