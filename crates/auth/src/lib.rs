//! `memberguard-auth`: membership decision boundary.
//!
//! The policy itself is pure; directory access goes through [`MembershipOracle`].

pub mod decision;
pub mod gate;
pub mod lifecycle;
pub mod oracle;

pub use decision::{decide, explain_decision, Decision, DecisionExplanation, DecisionInput, RegistrationScope};
pub use gate::{Evaluation, GateError, GatePolicy, MembershipGate};
pub use lifecycle::{LifecycleError, PhaseEvent, RequestPhase};
pub use oracle::{MemberStanding, MembershipOracle, OracleError};
