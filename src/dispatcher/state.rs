//! Worker lifecycle state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle of a worker execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No context has been created for this id.
    Uninitialized,
    /// Context spawned, waiting for the init acknowledgement.
    Initializing,
    /// Ready to accept tasks.
    Active,
    /// Torn down, or its link closed.
    Terminated,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Uninitialized, Initializing) |
            (Initializing, Active) | (Initializing, Terminated) |
            (Active, Terminated) |
            // A terminated id may be registered again
            (Terminated, Initializing)
        )
    }

    pub fn accepts_tasks(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_transitions() {
        use WorkerState::*;
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Active));
        assert!(Active.can_transition_to(Terminated));
        assert!(Terminated.can_transition_to(Initializing));

        assert!(!Uninitialized.can_transition_to(Active));
        assert!(!Active.can_transition_to(Initializing));
        assert!(!Terminated.can_transition_to(Active));
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(WorkerState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(WorkerState::Terminated.to_string(), "terminated");
    }
}
