// error.rs — Error types for the execution engine.
//
// Structural and state errors are rejected synchronously to the caller.
// Per-file-change failures during execution are deliberately NOT raised
// here — they are captured into the file change's error_message, escalate
// to step/plan failure records, and surface through the audit trail with
// the code BACKING_STORE_FAILURE. Callers inspect plan state afterward.

use thiserror::Error;
use uuid::Uuid;

use devos_plan::PlanError;

/// Errors the engine rejects synchronously.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An execute or rollback is already in flight for this plan.
    /// Callers must poll and retry — calls are never queued.
    #[error("plan is busy: an execution or rollback is already in flight")]
    PlanBusy,

    /// The plan cannot be approved while confirmation-required work is
    /// unresolved.
    #[error("plan approval blocked: {blocking} confirmation-required item(s) still pending")]
    PendingApprovalRequired { blocking: usize },

    /// The external precondition validator could not be reached.
    /// Validation fails closed — it never silently passes.
    #[error("precondition validator unavailable: {0}")]
    ValidationUnavailable(String),

    /// A step was asked to execute before its dependencies completed.
    #[error("step {step_id} is not ready: unmet or failed dependencies")]
    StepNotReady { step_id: Uuid },

    /// A state or data error from the plan model.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// An audit journal failure.
    #[error(transparent)]
    Audit(#[from] devos_audit::AuditError),
}
