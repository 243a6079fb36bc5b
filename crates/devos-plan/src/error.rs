// error.rs — Error types for the plan data model.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while mutating plan, step, or file-change state.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Illegal state-machine move. The state is left unchanged.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Malformed input (out-of-range progress, missing required field).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Rollback was requested for a change with no backup reference.
    #[error("no backup available to roll back file change {file_change_id}")]
    RollbackUnavailable { file_change_id: Uuid },

    /// The step dependency graph contains a cycle.
    #[error("dependency cycle involving step {step_id}")]
    DependencyCycle { step_id: Uuid },

    /// A dependency references a step that is not part of the plan.
    #[error("step {step_id} depends on unknown step {dependency_id}")]
    UnknownDependency { step_id: Uuid, dependency_id: Uuid },

    /// The requested step is not part of this plan.
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// The requested file change is not part of this step.
    #[error("file change not found: {0}")]
    FileChangeNotFound(Uuid),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
