//! Canonical workload state machine
//!
//! ```text
//! Pending -> Deploying -> Running <-> Paused
//!                         Running/Paused -> Stopped -> Running
//! any non-terminal -> Terminated
//! any non-terminal -> Failed
//! ```
//!
//! `Terminated` and `Failed` are absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadState {
    Pending,
    Deploying,
    Running,
    Paused,
    Stopped,
    Terminated,
    Failed,
}

impl WorkloadState {
    /// `Terminated` and `Failed` accept no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// States a workload settles in between operations
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Stopped)
    }

    /// Whether `self -> to` is a legal transition
    ///
    /// Staying in the same state is not a transition; callers treat it as
    /// an idempotent no-op before asking.
    pub fn can_transition_to(&self, to: WorkloadState) -> bool {
        use WorkloadState::*;

        if self.is_terminal() || *self == to {
            return false;
        }
        match (self, to) {
            (_, Terminated) | (_, Failed) => true,
            (Pending, Deploying) => true,
            (Deploying, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Stopped) | (Paused, Stopped) => true,
            (Stopped, Running) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Deploying => "Deploying",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Terminated => "Terminated",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend's native status after translation
///
/// Adapters map their own vocabulary into this at every query; the shared
/// table then resolves it against the recorded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// The native status has a clean canonical counterpart
    Stable(WorkloadState),
    /// The backend is between states (starting, stopping, updating...);
    /// the last stable recorded state stands
    Transitional,
    /// The backend has no record of the resource
    Gone,
}

/// Emitted on every state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(rename = "workloadID")]
    pub workload_id: String,
    pub previous_state: WorkloadState,
    pub new_state: WorkloadState,
    pub occurred_at: DateTime<Utc>,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::WorkloadState::*;
    use super::*;

    const ALL: [WorkloadState; 7] = [
        Pending, Deploying, Running, Paused, Stopped, Terminated, Failed,
    ];

    #[test]
    fn test_forward_path() {
        assert!(Pending.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Paused.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
    }

    #[test]
    fn test_deploying_is_not_reentered() {
        for state in ALL {
            if state != Pending {
                assert!(!state.can_transition_to(Deploying), "{state} -> Deploying");
            }
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for from in [Terminated, Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_any_non_terminal_may_terminate_or_fail() {
        for state in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(Terminated));
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_illegal_shortcuts() {
        assert!(!Pending.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Paused));
        assert!(!Deploying.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_status_update_wire_names() {
        let update = StatusUpdate {
            workload_id: "aws-d1".into(),
            previous_state: Deploying,
            new_state: Running,
            occurred_at: Utc::now(),
            detail: "deployed".into(),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"workloadID\":\"aws-d1\""));
        assert!(json.contains("\"previousState\":\"Deploying\""));
        assert!(json.contains("\"newState\":\"Running\""));
    }
}
