//! Per-request lifecycle of a membership check.
//!
//! ```text
//! Evaluating ─┬─> Allowed                (terminal)
//!             ├─> Rejected               (terminal)
//!             └─> AwaitingRegistration ──> Resumed ──> Evaluating
//! ```

use serde::Serialize;
use thiserror::Error;

use crate::decision::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Evaluating,
    Allowed,
    Rejected,
    AwaitingRegistration,
    Resumed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid lifecycle transition from {from:?} on {event:?}")]
pub struct LifecycleError {
    pub from: RequestPhase,
    pub event: PhaseEvent,
}

/// Things that move a request between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Decided(Decision),
    CallbackReceived,
    Reevaluate,
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestPhase::Allowed | RequestPhase::Rejected)
    }

    pub fn transition(self, event: PhaseEvent) -> Result<RequestPhase, LifecycleError> {
        match (self, event) {
            (RequestPhase::Evaluating, PhaseEvent::Decided(Decision::Allow)) => Ok(RequestPhase::Allowed),
            (RequestPhase::Evaluating, PhaseEvent::Decided(Decision::Reject)) => Ok(RequestPhase::Rejected),
            (RequestPhase::Evaluating, PhaseEvent::Decided(Decision::Register(_))) => {
                Ok(RequestPhase::AwaitingRegistration)
            }
            (RequestPhase::AwaitingRegistration, PhaseEvent::CallbackReceived) => Ok(RequestPhase::Resumed),
            (RequestPhase::Resumed, PhaseEvent::Reevaluate) => Ok(RequestPhase::Evaluating),
            (from, event) => Err(LifecycleError { from, event }),
        }
    }
}
