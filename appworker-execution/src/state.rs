//! Per-execution lifecycle state machine

use std::fmt;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ExecutionError, TimeoutPhase};

/// Lifecycle of a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    Created,
    Spawning,
    AwaitingReady,
    Running,
    Draining,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }

    /// Legal moves of the lifecycle
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;

        match (self, next) {
            (Created, Spawning) => true,
            (Spawning, AwaitingReady) => true,
            (AwaitingReady, Running) => true,
            (Running, Draining) => true,
            (Running | Draining, Completed) => true,
            (Created | Spawning | AwaitingReady | Running | Draining, Failed) => true,
            (AwaitingReady | Running | Draining, TimedOut) => true,
            _ => false,
        }
    }

    /// Phase reported when a deadline elapses in this state
    pub fn timeout_phase(self) -> TimeoutPhase {
        match self {
            ExecutionState::Draining => TimeoutPhase::Draining,
            ExecutionState::Running => TimeoutPhase::Running,
            _ => TimeoutPhase::AwaitingReady,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Created => "created",
            ExecutionState::Spawning => "spawning",
            ExecutionState::AwaitingReady => "awaiting_ready",
            ExecutionState::Running => "running",
            ExecutionState::Draining => "draining",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Tracks the state of one execution and rejects illegal transitions
#[derive(Debug)]
pub struct StateMachine {
    execution_id: Uuid,
    state: ExecutionState,
    entered_at: Instant,
}

impl StateMachine {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            state: ExecutionState::Created,
            entered_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn transition(&mut self, next: ExecutionState) -> Result<(), ExecutionError> {
        if !self.state.can_transition_to(next) {
            return Err(ExecutionError::InvalidState {
                from: self.state,
                to: next,
            });
        }

        debug!(
            execution_id = %self.execution_id,
            from = %self.state,
            to = %next,
            elapsed_ms = self.entered_at.elapsed().as_millis() as u64,
            "Execution state transition"
        );
        self.state = next;
        self.entered_at = Instant::now();
        Ok(())
    }

    /// Move to the terminal state matching `error`
    ///
    /// A machine that is already terminal keeps its state.
    pub fn fail(&mut self, error: &ExecutionError) {
        if self.state.is_terminal() {
            return;
        }
        let next = if error.is_timeout() {
            ExecutionState::TimedOut
        } else {
            ExecutionState::Failed
        };
        let next = if self.state.can_transition_to(next) {
            next
        } else {
            ExecutionState::Failed
        };
        // Failed is reachable from every non-terminal state
        let _ = self.transition(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_happy_path() {
        let mut machine = StateMachine::new(Uuid::new_v4());
        for next in [
            ExecutionState::Spawning,
            ExecutionState::AwaitingReady,
            ExecutionState::Running,
            ExecutionState::Draining,
            ExecutionState::Completed,
        ] {
            machine.transition(next).unwrap();
        }
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        use ExecutionState::*;

        assert!(!Created.can_transition_to(Running));
        assert!(!Spawning.can_transition_to(Completed));
        assert!(!AwaitingReady.can_transition_to(Draining));
        assert!(!Draining.can_transition_to(Running));
        assert!(!Created.can_transition_to(TimedOut));

        for terminal in [Completed, Failed, TimedOut] {
            for next in [Created, Spawning, Running, Completed, Failed, TimedOut] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }

        let mut machine = StateMachine::new(Uuid::new_v4());
        let err = machine.transition(Running).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::InvalidState {
                from: Created,
                to: Running
            }
        ));
        assert_eq!(machine.state(), Created);
    }

    #[test]
    fn test_fail_picks_terminal_state() {
        let timeout = ExecutionError::TimedOut {
            phase: TimeoutPhase::Running,
            after: Duration::from_secs(1),
            process_terminated: true,
        };

        let mut machine = StateMachine::new(Uuid::new_v4());
        machine.transition(ExecutionState::Spawning).unwrap();
        machine.transition(ExecutionState::AwaitingReady).unwrap();
        machine.transition(ExecutionState::Running).unwrap();
        machine.fail(&timeout);
        assert_eq!(machine.state(), ExecutionState::TimedOut);

        // Spawning cannot time out, so a timeout there still ends in Failed
        let mut machine = StateMachine::new(Uuid::new_v4());
        machine.transition(ExecutionState::Spawning).unwrap();
        machine.fail(&timeout);
        assert_eq!(machine.state(), ExecutionState::Failed);

        let mut machine = StateMachine::new(Uuid::new_v4());
        machine.fail(&ExecutionError::Cancelled);
        assert_eq!(machine.state(), ExecutionState::Failed);
        machine.fail(&timeout);
        assert_eq!(machine.state(), ExecutionState::Failed);
    }
}
