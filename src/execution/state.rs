use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one script's executions.
///
/// `Idle → Validating → Running → {Completed | Failed | Cancelled}`.
/// A terminal state may start over at `Validating` for the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    #[default]
    Idle,
    Validating,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match (self, next) {
            (Idle, Validating) => true,
            (Validating, Running | Failed) => true,
            (Running, Completed | Failed | Cancelled) => true,
            (from, Validating) => from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Validating => "validating",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The script exited with a non-zero code
    ExitCode,
    Timeout,
    ResourceLimit,
    /// Spawn or OS-level failure
    Process,
    Cancelled,
}

impl FailureKind {
    /// True when the system stopped the script rather than the script
    /// failing on its own.
    pub fn is_system_stop(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::ResourceLimit)
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionState::*;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Idle.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Completed.can_transition_to(Validating));
    }

    #[test]
    fn test_only_running_can_be_cancelled() {
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Validating.can_transition_to(Cancelled));
        assert!(!Idle.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!Idle.can_transition_to(Running));
        assert!(!Running.can_transition_to(Validating));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Running));
        assert!(Validating.can_transition_to(Failed));
    }

    #[test]
    fn test_failure_kind_classification() {
        assert!(FailureKind::Timeout.is_system_stop());
        assert!(FailureKind::ResourceLimit.is_system_stop());
        assert!(!FailureKind::ExitCode.is_system_stop());
        assert!(!FailureKind::Cancelled.is_system_stop());
        assert_eq!(
            serde_json::to_string(&FailureKind::ResourceLimit).unwrap(),
            "\"resourceLimit\""
        );
    }
}
