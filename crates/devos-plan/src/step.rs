// step.rs — PlanStep: an ordered unit of work within an ActionPlan.
//
// A step owns zero or more FileChanges and a set of dependencies on
// other steps. A step may only start once every dependency completed;
// the engine resolves that ordering, this module enforces the local
// state machine and the confirmation-gated manual overrides.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlanError;
use crate::file_change::FileChange;
use crate::status::ExecutionStatus;

/// What kind of work a step performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Analysis,
    Planning,
    Validation,
    Backup,
    FileOperation,
    Test,
    Cleanup,
}

/// Relative urgency of a step or plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// How risky a step or plan is judged to be.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Execution hints attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    pub risk_level: RiskLevel,
    /// When true the step must be manually approved or rejected before
    /// the plan may be approved for execution.
    pub requires_user_confirmation: bool,
    pub can_rollback: bool,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            estimated_duration_secs: None,
            risk_level: RiskLevel::Low,
            requires_user_confirmation: false,
            can_rollback: true,
        }
    }
}

/// One ordered unit of work in an ActionPlan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: Uuid,
    pub kind: StepKind,
    pub title: String,
    pub description: String,
    pub status: ExecutionStatus,
    pub priority: Priority,
    /// IDs of steps that must complete before this one may run.
    pub dependencies: Vec<Uuid>,
    /// File changes applied sequentially when this step executes.
    pub file_changes: Vec<FileChange>,
    pub metadata: StepMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Approximate completion percentage, settable only while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl PlanStep {
    pub fn new(kind: StepKind, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            title: title.into(),
            description: description.into(),
            status: ExecutionStatus::Pending,
            priority: Priority::Medium,
            dependencies: Vec::new(),
            file_changes: Vec::new(),
            metadata: StepMetadata::default(),
            started_at: None,
            completed_at: None,
            progress: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_file_changes(mut self, file_changes: Vec<FileChange>) -> Self {
        self.file_changes = file_changes;
        self
    }

    pub fn with_metadata(mut self, metadata: StepMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Pure readiness predicate: pending, with every dependency in the
    /// given completed set.
    pub fn can_execute(&self, completed: &HashSet<Uuid>) -> bool {
        self.status == ExecutionStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Look up an owned file change by id.
    pub fn file_change(&self, file_change_id: Uuid) -> Result<&FileChange, PlanError> {
        self.file_changes
            .iter()
            .find(|fc| fc.id == file_change_id)
            .ok_or(PlanError::FileChangeNotFound(file_change_id))
    }

    pub fn file_change_mut(&mut self, file_change_id: Uuid) -> Result<&mut FileChange, PlanError> {
        self.file_changes
            .iter_mut()
            .find(|fc| fc.id == file_change_id)
            .ok_or(PlanError::FileChangeNotFound(file_change_id))
    }

    /// Transition into running and stamp the start time.
    pub fn begin(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transition into completed, stamp completion, set progress to 100.
    pub fn complete(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.progress = Some(100);
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Cancelled)
    }

    /// Reset a failed step to pending so execution can be resumed.
    pub fn reset_for_retry(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Pending)?;
        self.started_at = None;
        self.completed_at = None;
        self.progress = None;
        Ok(())
    }

    /// Manual override: a confirmation-required pending step may be
    /// approved outright, bypassing automatic execution. The step's
    /// pending file changes are approved with it so nothing is left
    /// blocking plan approval.
    pub fn approve_manually(&mut self) -> Result<(), PlanError> {
        self.guard_manual_override()?;
        for fc in &mut self.file_changes {
            fc.approve();
        }
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.progress = Some(100);
        Ok(())
    }

    /// Manual override: a confirmation-required pending step may be
    /// rejected outright, along with its pending file changes.
    pub fn reject_manually(&mut self) -> Result<(), PlanError> {
        self.guard_manual_override()?;
        for fc in &mut self.file_changes {
            if fc.status == ExecutionStatus::Pending {
                fc.reject()?;
            }
        }
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Update progress. Only while running; values above 100 are
    /// invalid. Monotonicity is deliberately not enforced — progress may
    /// be approximate.
    pub fn update_progress(&mut self, pct: u8) -> Result<(), PlanError> {
        if self.status != ExecutionStatus::Running {
            return Err(PlanError::InvalidTransition {
                from: self.status.to_string(),
                to: "progress update".to_string(),
            });
        }
        if pct > 100 {
            return Err(PlanError::InvalidArgument(format!(
                "progress must be within 0..=100, got {pct}"
            )));
        }
        self.progress = Some(pct);
        Ok(())
    }

    /// True once the step can make no further forward progress.
    pub fn is_settled(&self) -> bool {
        self.status.is_settled()
    }

    fn guard_manual_override(&self) -> Result<(), PlanError> {
        if !self.metadata.requires_user_confirmation {
            return Err(PlanError::InvalidArgument(
                "manual override is only available for confirmation-required steps".to_string(),
            ));
        }
        if self.status != ExecutionStatus::Pending {
            return Err(PlanError::InvalidTransition {
                from: self.status.to_string(),
                to: "manual override".to_string(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: ExecutionStatus) -> Result<(), PlanError> {
        if !self.status.can_transition_to(next) {
            return Err(PlanError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::file_change::{FileChange, FileOperation};

    fn confirmation_step() -> PlanStep {
        let fc =
            FileChange::new(FileOperation::Create, "src/new.rs", Vec::new(), 16, "rust").unwrap();
        PlanStep::new(StepKind::FileOperation, "Update module", "Apply the patch")
            .with_file_changes(vec![fc])
            .with_metadata(StepMetadata {
                requires_user_confirmation: true,
                ..StepMetadata::default()
            })
    }

    #[test]
    fn can_execute_requires_pending_and_completed_deps() {
        let dep_id = Uuid::new_v4();
        let step = PlanStep::new(StepKind::Test, "Run tests", "cargo test")
            .with_dependencies(vec![dep_id]);

        assert!(!step.can_execute(&HashSet::new()));
        let completed: HashSet<Uuid> = [dep_id].into_iter().collect();
        assert!(step.can_execute(&completed));
    }

    #[test]
    fn can_execute_is_false_once_running() {
        let mut step = PlanStep::new(StepKind::Analysis, "Analyze", "Look around");
        step.begin().unwrap();
        assert!(!step.can_execute(&HashSet::new()));
    }

    #[test]
    fn begin_and_complete_stamp_timestamps() {
        let mut step = PlanStep::new(StepKind::Analysis, "Analyze", "Look around");
        step.begin().unwrap();
        assert!(step.started_at.is_some());
        step.complete().unwrap();
        assert!(step.completed_at.is_some());
        assert_eq!(step.progress, Some(100));
    }

    #[test]
    fn complete_without_begin_is_rejected() {
        let mut step = PlanStep::new(StepKind::Analysis, "Analyze", "Look around");
        let result = step.complete();
        assert!(matches!(result, Err(PlanError::InvalidTransition { .. })));
        assert_eq!(step.status, ExecutionStatus::Pending);
    }

    #[test]
    fn progress_only_while_running() {
        let mut step = PlanStep::new(StepKind::Test, "Run tests", "cargo test");
        assert!(step.update_progress(10).is_err());
        step.begin().unwrap();
        step.update_progress(40).unwrap();
        // Non-monotonic updates are allowed.
        step.update_progress(25).unwrap();
        assert_eq!(step.progress, Some(25));
    }

    #[test]
    fn progress_above_100_is_invalid_argument() {
        let mut step = PlanStep::new(StepKind::Test, "Run tests", "cargo test");
        step.begin().unwrap();
        assert!(matches!(
            step.update_progress(101),
            Err(PlanError::InvalidArgument(_))
        ));
        assert_eq!(step.progress, None);
    }

    #[test]
    fn manual_override_requires_confirmation_flag() {
        let mut step = PlanStep::new(StepKind::Cleanup, "Tidy", "Remove temp files");
        assert!(matches!(
            step.approve_manually(),
            Err(PlanError::InvalidArgument(_))
        ));
    }

    #[test]
    fn manual_approve_completes_step_and_its_changes() {
        let mut step = confirmation_step();
        step.approve_manually().unwrap();
        assert_eq!(step.status, ExecutionStatus::Completed);
        assert_eq!(step.progress, Some(100));
        assert_eq!(step.file_changes[0].status, ExecutionStatus::Completed);
    }

    #[test]
    fn manual_reject_fails_step_and_its_changes() {
        let mut step = confirmation_step();
        step.reject_manually().unwrap();
        assert_eq!(step.status, ExecutionStatus::Failed);
        assert_eq!(step.file_changes[0].status, ExecutionStatus::Failed);
    }

    #[test]
    fn manual_override_only_from_pending() {
        let mut step = confirmation_step();
        step.approve_manually().unwrap();
        assert!(matches!(
            step.reject_manually(),
            Err(PlanError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn reset_for_retry_clears_run_state() {
        let mut step = PlanStep::new(StepKind::Test, "Run tests", "cargo test");
        step.begin().unwrap();
        step.fail().unwrap();
        step.reset_for_retry().unwrap();
        assert_eq!(step.status, ExecutionStatus::Pending);
        assert!(step.started_at.is_none());
        assert!(step.progress.is_none());
    }

    #[test]
    fn serialization_round_trip_preserves_dependencies() {
        let dep = Uuid::new_v4();
        let step = PlanStep::new(StepKind::Backup, "Backup", "Snapshot files")
            .with_priority(Priority::High)
            .with_dependencies(vec![dep]);
        let json = serde_json::to_string(&step).unwrap();
        let restored: PlanStep = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, step.id);
        assert_eq!(restored.dependencies, vec![dep]);
        assert_eq!(restored.priority, Priority::High);
    }
}
