//! # devos-plan
//!
//! The plan data model for the DevOS action-plan engine: [`ActionPlan`],
//! [`PlanStep`], and [`FileChange`], each with an enforced lifecycle
//! state machine.
//!
//! Status ownership is strict: the execution engine (devos-engine) is the
//! only mutator of plan, step, and file-change status. Reviewer-facing
//! collaborators request transitions (approve, reject, retry) through the
//! typed operations here — every operation validates its edge against the
//! status graph and rejects anything else with
//! [`PlanError::InvalidTransition`], leaving state untouched.

pub mod error;
pub mod file_change;
pub mod plan;
pub mod status;
pub mod step;

pub use error::PlanError;
pub use file_change::{ChangeMetadata, FileChange, FileOperation};
pub use plan::{
    ActionPlan, PlanFailure, PlanMetadata, PlanSummary, RollbackInfo, Timeline, ValidationSpec,
};
pub use status::{ExecutionStatus, PlanStatus};
pub use step::{PlanStep, Priority, RiskLevel, StepKind, StepMetadata};
