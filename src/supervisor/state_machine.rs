use serde::Serialize;
use thiserror::Error;

/// In-memory lifecycle phase of one descriptor.
///
/// Only `Stopped` and `Running` are ever persisted; the transient phases exist
/// while a Start or Stop call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(Phase, Phase),
}

#[derive(Debug)]
pub struct StateMachine {
    phase: Phase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { phase: Phase::Stopped }
    }
}

impl StateMachine {
    pub fn new(initial: Phase) -> Self {
        Self { phase: initial }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn can_transition(&self, to: Phase) -> bool {
        matches!(
            (self.phase, to),
            (Phase::Stopped, Phase::Starting)
                | (Phase::Starting, Phase::Running)
                // launch failed
                | (Phase::Starting, Phase::Stopped)
                | (Phase::Running, Phase::Stopping)
                // external exit (crash or operator kill)
                | (Phase::Running, Phase::Stopped)
                | (Phase::Stopping, Phase::Stopped)
                // termination failed, process confirmed alive
                | (Phase::Stopping, Phase::Running)
        )
    }

    pub fn transition(&mut self, to: Phase) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("State transition: {:?} -> {:?}", self.phase, to);
            self.phase = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.phase, to))
        }
    }

    /// Overwrite the phase from persisted state (startup reconciliation).
    /// Refuses while an operation is in flight.
    pub fn reset(&mut self, to: Phase) -> Result<(), TransitionError> {
        match self.phase {
            Phase::Starting | Phase::Stopping => {
                Err(TransitionError::InvalidTransition(self.phase, to))
            }
            _ => {
                self.phase = to;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::default();
        assert_eq!(sm.phase(), Phase::Stopped);
        assert!(sm.transition(Phase::Starting).is_ok());
        assert!(sm.transition(Phase::Running).is_ok());
        assert!(sm.transition(Phase::Stopping).is_ok());
        assert!(sm.transition(Phase::Stopped).is_ok());
    }

    #[test]
    fn external_exit_goes_straight_to_stopped() {
        let mut sm = StateMachine::new(Phase::Running);
        assert!(sm.transition(Phase::Stopped).is_ok());
    }

    #[test]
    fn invalid_transition() {
        let mut sm = StateMachine::default();
        // cannot go directly from Stopped -> Running
        assert_eq!(
            sm.transition(Phase::Running),
            Err(TransitionError::InvalidTransition(Phase::Stopped, Phase::Running))
        );
    }

    #[test]
    fn in_flight_phases_only_complete() {
        let mut sm = StateMachine::new(Phase::Starting);
        assert!(sm.transition(Phase::Stopping).is_err());
        assert!(sm.reset(Phase::Stopped).is_err());

        let mut sm = StateMachine::new(Phase::Stopping);
        assert!(sm.transition(Phase::Starting).is_err());
        assert!(sm.transition(Phase::Stopped).is_ok());
    }

    #[test]
    fn reset_from_settled_phase() {
        let mut sm = StateMachine::new(Phase::Running);
        assert!(sm.reset(Phase::Stopped).is_ok());
        assert_eq!(sm.phase(), Phase::Stopped);
    }
}
