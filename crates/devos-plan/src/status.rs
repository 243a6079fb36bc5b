// status.rs — Execution and plan lifecycle state machines.
//
// Two state sets live here:
//
// ExecutionStatus (shared by FileChange and PlanStep):
//   pending → running → {completed | failed | cancelled}
//   completed → rollback_pending → rollback_running → rollback_completed
//   failed → pending            (retry)
//   pending → cancelled         (the only edge that skips running)
//
// PlanStatus (ActionPlan lifecycle):
//   planning → pending → {approved | rejected}
//   approved → applying → {applied | rolled_back}
//   applied → rolled_back       (post-hoc rollback)
//   Terminal: rejected, rolled_back.
//
// Every mutation goes through can_transition_to — an edge not in the
// graph is rejected before any state changes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by file changes and plan steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Not yet started (or reset by a retry).
    Pending,
    /// Actively being applied.
    Running,
    /// Applied successfully (or approved in bulk by a reviewer).
    Completed,
    /// Application failed or the reviewer rejected it.
    Failed,
    /// Skipped — either cancelled directly or cascaded from a failed dependency.
    Cancelled,
    /// Rollback requested, not yet restoring.
    RollbackPending,
    /// Restoring from backup.
    RollbackRunning,
    /// Restored to the pre-apply state.
    RollbackCompleted,
}

impl ExecutionStatus {
    /// Check whether transitioning from this status to `next` is valid.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Completed, RollbackPending)
                | (RollbackPending, RollbackRunning)
                | (RollbackRunning, RollbackCompleted)
                // Retrying a failure resets to pending.
                | (Failed, Pending)
        )
    }

    /// Statuses with no outgoing forward edge (retry and rollback excluded).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::RollbackCompleted
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::RollbackPending => "rollback_pending",
            ExecutionStatus::RollbackRunning => "rollback_running",
            ExecutionStatus::RollbackCompleted => "rollback_completed",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of an ActionPlan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Being built from an AI response; steps may still be added.
    Planning,
    /// Fully populated, awaiting reviewer approval.
    Pending,
    /// Reviewer approved — ready to execute.
    Approved,
    /// Reviewer rejected. Terminal.
    Rejected,
    /// Steps are executing.
    Applying,
    /// All steps completed. Terminal unless rolled back.
    Applied,
    /// Changes were rolled back. Terminal.
    RolledBack,
}

impl PlanStatus {
    /// Check whether transitioning from this status to `next` is valid.
    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        use PlanStatus::*;
        matches!(
            (self, next),
            (Planning, Pending)
                | (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Applying)
                | (Applying, Applied)
                | (Applying, RolledBack)
                | (Applied, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Rejected | PlanStatus::RolledBack)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Planning => "planning",
            PlanStatus::Pending => "pending",
            PlanStatus::Approved => "approved",
            PlanStatus::Rejected => "rejected",
            PlanStatus::Applying => "applying",
            PlanStatus::Applied => "applied",
            PlanStatus::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    #[test]
    fn forward_execution_path_is_valid() {
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
    }

    #[test]
    fn rollback_path_is_valid() {
        assert!(Completed.can_transition_to(RollbackPending));
        assert!(RollbackPending.can_transition_to(RollbackRunning));
        assert!(RollbackRunning.can_transition_to(RollbackCompleted));
    }

    #[test]
    fn only_cancelled_may_skip_running() {
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn retry_resets_failed_to_pending() {
        assert!(Failed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
    }

    #[test]
    fn rollback_requires_completed() {
        assert!(!Failed.can_transition_to(RollbackPending));
        assert!(!Pending.can_transition_to(RollbackPending));
        assert!(!RollbackCompleted.can_transition_to(RollbackPending));
    }

    #[test]
    fn settled_statuses() {
        assert!(Completed.is_settled());
        assert!(Failed.is_settled());
        assert!(Cancelled.is_settled());
        assert!(RollbackCompleted.is_settled());
        assert!(!Pending.is_settled());
        assert!(!Running.is_settled());
        assert!(!RollbackPending.is_settled());
    }

    #[test]
    fn plan_forward_path_is_valid() {
        assert!(PlanStatus::Planning.can_transition_to(PlanStatus::Pending));
        assert!(PlanStatus::Pending.can_transition_to(PlanStatus::Approved));
        assert!(PlanStatus::Pending.can_transition_to(PlanStatus::Rejected));
        assert!(PlanStatus::Approved.can_transition_to(PlanStatus::Applying));
        assert!(PlanStatus::Applying.can_transition_to(PlanStatus::Applied));
        assert!(PlanStatus::Applied.can_transition_to(PlanStatus::RolledBack));
    }

    #[test]
    fn plan_cannot_skip_review() {
        assert!(!PlanStatus::Planning.can_transition_to(PlanStatus::Approved));
        assert!(!PlanStatus::Pending.can_transition_to(PlanStatus::Applying));
        assert!(!PlanStatus::Planning.can_transition_to(PlanStatus::Applied));
    }

    #[test]
    fn terminal_plan_states_have_no_exits() {
        for next in [
            PlanStatus::Planning,
            PlanStatus::Pending,
            PlanStatus::Approved,
            PlanStatus::Applying,
            PlanStatus::Applied,
            PlanStatus::RolledBack,
        ] {
            assert!(!PlanStatus::Rejected.can_transition_to(next));
            assert!(!PlanStatus::RolledBack.can_transition_to(next));
        }
    }

    #[test]
    fn status_display_is_snake_case() {
        assert_eq!(RollbackPending.to_string(), "rollback_pending");
        assert_eq!(PlanStatus::RolledBack.to_string(), "rolled_back");
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&RollbackRunning).unwrap();
        assert_eq!(json, "\"rollback_running\"");
        let json = serde_json::to_string(&PlanStatus::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
    }
}
