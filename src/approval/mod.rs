//! Artifact approval engine
//!
//! Multi-step review chains where each step is decided by quorum with a
//! rejection veto. Approvers may be bound through project membership or
//! directly, and may be covered by time-bounded delegations.

pub mod delegation;
pub mod engine;
pub mod gate;
pub mod progress;
pub mod recompute;
pub mod recorder;
pub mod resolver;

pub use delegation::{DelegationResolver, Principal};
pub use engine::{ApprovalEngine, ApprovalEvent};
pub use gate::{AuthorizationGate, CanAct, PendingStep};
pub use progress::{ProgressReporter, ProgressSnapshot, StepProgress};
pub use recompute::{RecomputeEngine, Verdict};
pub use recorder::{DecisionRecorder, NewDecision};
pub use resolver::ApproverResolver;
