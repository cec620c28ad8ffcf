//! Allowed phase transitions.

use crate::errors::OrchestratorError;
use crate::state::Phase;

/// Guards every phase change the orchestrator makes.
pub struct PhaseMachine;

impl PhaseMachine {
    pub fn can_transition(from: Phase, to: Phase) -> bool {
        use Phase::*;
        if from.is_terminal() {
            return false;
        }
        // Any live phase may fail.
        if to == Error {
            return true;
        }
        matches!(
            (from, to),
            (Idle, Planning)
                | (Planning, AwaitingApproval)
                | (Planning, Executing)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Idle)
                | (Executing, Auditing)
                | (Executing, Recovery)
                | (Auditing, Executing)
                | (Auditing, Observing)
                | (Auditing, Complete)
                | (Auditing, Recovery)
                | (Recovery, Auditing)
                | (Observing, Executing)
                | (Observing, Complete)
        )
    }

    pub fn transition(from: Phase, to: Phase) -> Result<Phase, OrchestratorError> {
        if Self::can_transition(from, to) {
            Ok(to)
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}
