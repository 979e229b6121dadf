//! Worker lifecycle state machine.
//!
//! Every worker publishes its own state into its shared-arena slot; the
//! supervisor only reads. Transitions are strictly monotonic along the happy
//! path (Init -> SyncWait -> Run -> Stop -> Deinit -> Exit), with Tidy as
//! the error detour and WaitComplete/Zombie as supervisor-side reap
//! observations.

use serde::{Deserialize, Serialize};

/// Discrete per-worker states, stored as one byte in the shared arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Just forked: handlers installed, scheduling policy applied
    Init = 0,

    /// Init complete, parked on the start barrier until all siblings arrive
    SyncWait = 1,

    /// Entry function running; every iteration checks the continue flag
    Run = 2,

    /// Parked mid-run waiting on siblings or external progress
    Wait = 3,

    /// Entry function returned; per-worker resources being released
    Stop = 4,

    /// Final state publication before _exit
    Exit = 5,

    /// Reaped by the supervisor (exit status captured)
    WaitComplete = 6,

    /// Exited but not yet reaped
    Zombie = 7,

    /// Error-path cleanup short-circuiting the normal Stop
    Tidy = 8,

    /// Worker-side teardown complete
    Deinit = 9,
}

impl WorkerState {
    /// Get the human-readable name for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Init => "init",
            WorkerState::SyncWait => "sync-wait",
            WorkerState::Run => "run",
            WorkerState::Wait => "wait",
            WorkerState::Stop => "stop",
            WorkerState::Exit => "exit",
            WorkerState::WaitComplete => "wait-complete",
            WorkerState::Zombie => "zombie",
            WorkerState::Tidy => "tidy",
            WorkerState::Deinit => "deinit",
        }
    }

    /// Decode a state byte read from the arena.
    pub fn from_u8(raw: u8) -> Option<WorkerState> {
        match raw {
            0 => Some(WorkerState::Init),
            1 => Some(WorkerState::SyncWait),
            2 => Some(WorkerState::Run),
            3 => Some(WorkerState::Wait),
            4 => Some(WorkerState::Stop),
            5 => Some(WorkerState::Exit),
            6 => Some(WorkerState::WaitComplete),
            7 => Some(WorkerState::Zombie),
            8 => Some(WorkerState::Tidy),
            9 => Some(WorkerState::Deinit),
            _ => None,
        }
    }

    /// Get all valid transitions FROM this state.
    pub fn valid_next_states(&self) -> &'static [WorkerState] {
        match self {
            WorkerState::Init => &[WorkerState::SyncWait, WorkerState::Tidy],
            WorkerState::SyncWait => &[WorkerState::Run, WorkerState::Tidy],
            WorkerState::Run => &[
                WorkerState::Stop,
                WorkerState::Exit,
                WorkerState::Wait,
                WorkerState::Tidy,
            ],
            WorkerState::Wait => &[WorkerState::Stop, WorkerState::Exit, WorkerState::Tidy],
            WorkerState::Stop => &[WorkerState::Deinit, WorkerState::Tidy],
            WorkerState::Tidy => &[WorkerState::Deinit],
            WorkerState::Deinit => &[WorkerState::Exit],
            WorkerState::Exit => &[WorkerState::WaitComplete, WorkerState::Zombie],
            WorkerState::Zombie => &[WorkerState::WaitComplete],
            WorkerState::WaitComplete => &[],
        }
    }

    /// Check if a transition to the given state is valid.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        self.valid_next_states().contains(&next)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Worker exit outcomes, the entry-contract return values.
///
/// Any other process exit code is coerced to `Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitOutcome {
    Success = 0,
    Failure = 1,
    NoResource = 2,
    NotImplemented = 3,
}

impl ExitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitOutcome::Success => "success",
            ExitOutcome::Failure => "failure",
            ExitOutcome::NoResource => "no-resource",
            ExitOutcome::NotImplemented => "not-implemented",
        }
    }

    /// Decode a wait(2) exit code; unknown codes coerce to Failure.
    pub fn from_code(code: i32) -> ExitOutcome {
        match code {
            0 => ExitOutcome::Success,
            2 => ExitOutcome::NoResource,
            3 => ExitOutcome::NotImplemented,
            _ => ExitOutcome::Failure,
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Severity for worst-of aggregation:
    /// FAILURE > NOT_IMPLEMENTED > NO_RESOURCE > SUCCESS.
    fn severity(&self) -> u8 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::NoResource => 1,
            ExitOutcome::NotImplemented => 2,
            ExitOutcome::Failure => 3,
        }
    }

    /// Combine two outcomes, keeping the worse one.
    pub fn worst(self, other: ExitOutcome) -> ExitOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Aggregate a whole run's outcomes.
    pub fn aggregate<I: IntoIterator<Item = ExitOutcome>>(outcomes: I) -> ExitOutcome {
        outcomes
            .into_iter()
            .fold(ExitOutcome::Success, ExitOutcome::worst)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_monotonic() {
        let path = [
            WorkerState::Init,
            WorkerState::SyncWait,
            WorkerState::Run,
            WorkerState::Stop,
            WorkerState::Deinit,
            WorkerState::Exit,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_path_through_tidy() {
        assert!(WorkerState::Run.can_transition_to(WorkerState::Tidy));
        assert!(WorkerState::Tidy.can_transition_to(WorkerState::Deinit));
        assert!(WorkerState::Deinit.can_transition_to(WorkerState::Exit));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!WorkerState::Run.can_transition_to(WorkerState::Init));
        assert!(!WorkerState::Stop.can_transition_to(WorkerState::Run));
        assert!(!WorkerState::Exit.can_transition_to(WorkerState::SyncWait));
        assert!(WorkerState::WaitComplete.valid_next_states().is_empty());
    }

    #[test]
    fn test_state_byte_roundtrip() {
        for raw in 0u8..=9 {
            let state = WorkerState::from_u8(raw).unwrap();
            assert_eq!(state as u8, raw);
        }
        assert_eq!(WorkerState::from_u8(10), None);
        assert_eq!(WorkerState::from_u8(0xff), None);
    }

    #[test]
    fn test_outcome_codes() {
        assert_eq!(ExitOutcome::from_code(0), ExitOutcome::Success);
        assert_eq!(ExitOutcome::from_code(2), ExitOutcome::NoResource);
        assert_eq!(ExitOutcome::from_code(3), ExitOutcome::NotImplemented);
        // Anything else coerces to failure
        assert_eq!(ExitOutcome::from_code(42), ExitOutcome::Failure);
        assert_eq!(ExitOutcome::from_code(-1), ExitOutcome::Failure);
    }

    #[test]
    fn test_worst_of_aggregation() {
        use ExitOutcome::*;
        assert_eq!(ExitOutcome::aggregate([Success, Success]), Success);
        assert_eq!(ExitOutcome::aggregate([Success, NoResource]), NoResource);
        assert_eq!(
            ExitOutcome::aggregate([NoResource, NotImplemented]),
            NotImplemented
        );
        assert_eq!(ExitOutcome::aggregate([NotImplemented, Failure]), Failure);
        // NOT_IMPLEMENTED alone yields NOT_IMPLEMENTED
        assert_eq!(ExitOutcome::aggregate([NotImplemented]), NotImplemented);
        assert_eq!(ExitOutcome::aggregate([]), Success);
    }
}
