// plan.rs — ActionPlan: the aggregate root for one unit of AI-proposed work.
//
// An ActionPlan owns an ordered sequence of PlanSteps plus plan-level
// metadata, a timeline, a rollback descriptor, and validation conditions.
// Construction starts in `planning`; `finalize()` verifies the dependency
// graph (unknown references, cycles) and moves the plan to `pending` —
// cycle detection happens once at creation time, never during execution.
//
// Status ownership: only the execution engine mutates plan status, via
// `transition()`. Collaborators read state and request transitions.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PlanError;
use crate::status::{ExecutionStatus, PlanStatus};
use crate::step::{PlanStep, Priority, RiskLevel};

/// Plan-level execution requirements and estimates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanMetadata {
    pub total_files: usize,
    pub estimated_duration_secs: u64,
    pub risk_level: RiskLevel,
    pub requires_git: bool,
    pub requires_build: bool,
    pub requires_test: bool,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            total_files: 0,
            estimated_duration_secs: 0,
            risk_level: RiskLevel::Low,
            requires_git: false,
            requires_build: false,
            requires_test: false,
        }
    }
}

/// Timestamps for the notable points of a plan's life.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeline {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl Timeline {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            applied_at: None,
            rolled_back_at: None,
        }
    }
}

/// Whether and from where this plan can be rolled back.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackInfo {
    pub is_available: bool,
    /// Opaque token naming the restore point (e.g., a commit hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_point: Option<String>,
}

/// Descriptive validation conditions attached to the plan.
///
/// The strings are opaque to the engine; whether a precondition actually
/// holds is delegated to an injected validator collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationSpec {
    pub pre_conditions: Vec<String>,
    pub post_conditions: Vec<String>,
    pub tests: Vec<String>,
}

/// Recorded failure information for a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanFailure {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_change_id: Option<Uuid>,
}

/// The aggregate root: ordered steps plus plan-level state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: PlanStatus,
    pub priority: Priority,
    pub steps: Vec<PlanStep>,
    pub metadata: PlanMetadata,
    pub timeline: Timeline,
    pub rollback: RollbackInfo,
    pub validation: ValidationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PlanFailure>,
}

impl ActionPlan {
    /// Create an empty plan in the planning state.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            status: PlanStatus::Planning,
            priority: Priority::Medium,
            steps: Vec::new(),
            metadata: PlanMetadata::default(),
            timeline: Timeline::new(),
            rollback: RollbackInfo::default(),
            validation: ValidationSpec::default(),
            error: None,
        }
    }

    /// Append a step. Only valid while the plan is still being built.
    pub fn add_step(&mut self, step: PlanStep) -> Result<(), PlanError> {
        if self.status != PlanStatus::Planning {
            return Err(PlanError::InvalidTransition {
                from: self.status.to_string(),
                to: "add_step".to_string(),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    /// Finish population: validate the dependency graph and move to
    /// pending. Cycles and unknown dependency references are rejected
    /// here, once, so execution never has to re-check.
    pub fn finalize(&mut self) -> Result<(), PlanError> {
        let known: HashSet<Uuid> = self.steps.iter().map(|s| s.id).collect();
        for step in &self.steps {
            for dep in &step.dependencies {
                if !known.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        step_id: step.id,
                        dependency_id: *dep,
                    });
                }
            }
        }
        self.execution_order()?;
        self.metadata.total_files = self
            .steps
            .iter()
            .map(|s| s.file_changes.len())
            .sum();
        self.transition(PlanStatus::Pending)
    }

    /// Transition plan status. An edge not in the PlanStatus graph is
    /// rejected and leaves the plan unchanged.
    pub fn transition(&mut self, next: PlanStatus) -> Result<(), PlanError> {
        if !self.status.can_transition_to(next) {
            return Err(PlanError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("plan {} status: {} -> {}", self.id, self.status, next);
        self.status = next;
        match next {
            PlanStatus::Applying => {
                if self.timeline.started_at.is_none() {
                    self.timeline.started_at = Some(Utc::now());
                }
            }
            PlanStatus::Applied => {
                let now = Utc::now();
                self.timeline.applied_at = Some(now);
                self.timeline.completed_at = Some(now);
            }
            PlanStatus::RolledBack => {
                self.timeline.rolled_back_at = Some(Utc::now());
            }
            _ => {}
        }
        Ok(())
    }

    /// Dependency-ordered step ids. Stable: among ready steps, original
    /// array position breaks ties, so execution matches authored intent.
    pub fn execution_order(&self) -> Result<Vec<Uuid>, PlanError> {
        let mut placed: HashSet<Uuid> = HashSet::new();
        let mut order = Vec::with_capacity(self.steps.len());

        while order.len() < self.steps.len() {
            let next = self.steps.iter().find(|step| {
                !placed.contains(&step.id)
                    && step.dependencies.iter().all(|dep| placed.contains(dep))
            });
            match next {
                Some(step) => {
                    placed.insert(step.id);
                    order.push(step.id);
                }
                None => {
                    // Remaining steps all wait on each other; report the
                    // first unplaced one.
                    if let Some(stuck) = self.steps.iter().find(|s| !placed.contains(&s.id)) {
                        return Err(PlanError::DependencyCycle { step_id: stuck.id });
                    }
                    break;
                }
            }
        }
        Ok(order)
    }

    /// Bulk reviewer approval: mark every pending file change across
    /// every step completed. Does not execute anything. Idempotent.
    pub fn approve_all(&mut self) {
        for step in &mut self.steps {
            for fc in &mut step.file_changes {
                fc.approve();
            }
        }
    }

    pub fn step(&self, step_id: Uuid) -> Result<&PlanStep, PlanError> {
        self.steps
            .iter()
            .find(|s| s.id == step_id)
            .ok_or(PlanError::StepNotFound(step_id))
    }

    pub fn step_mut(&mut self, step_id: Uuid) -> Result<&mut PlanStep, PlanError> {
        self.steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or(PlanError::StepNotFound(step_id))
    }

    /// IDs of steps that have completed.
    pub fn completed_step_ids(&self) -> HashSet<Uuid> {
        self.steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .map(|s| s.id)
            .collect()
    }

    /// Steps that still require manual confirmation before the plan may
    /// be approved: confirmation-required and still pending.
    pub fn unresolved_confirmations(&self) -> Vec<Uuid> {
        self.steps
            .iter()
            .filter(|s| {
                s.metadata.requires_user_confirmation && s.status == ExecutionStatus::Pending
            })
            .map(|s| s.id)
            .collect()
    }

    /// Record a plan-level failure. The first recorded failure wins —
    /// later failures do not overwrite it.
    pub fn record_failure(&mut self, failure: PlanFailure) {
        if self.error.is_none() {
            self.error = Some(failure);
        }
    }

    /// Aggregated counters for observers.
    pub fn summary(&self) -> PlanSummary {
        let total_file_changes: usize = self.steps.iter().map(|s| s.file_changes.len()).sum();
        let completed_file_changes = self
            .steps
            .iter()
            .flat_map(|s| &s.file_changes)
            .filter(|fc| fc.status == ExecutionStatus::Completed)
            .count();
        PlanSummary {
            total_steps: self.steps.len(),
            completed_steps: self
                .steps
                .iter()
                .filter(|s| s.status == ExecutionStatus::Completed)
                .count(),
            failed_steps: self
                .steps
                .iter()
                .filter(|s| s.status == ExecutionStatus::Failed)
                .count(),
            pending_steps: self
                .steps
                .iter()
                .filter(|s| s.status == ExecutionStatus::Pending)
                .count(),
            total_file_changes,
            completed_file_changes,
            estimated_duration_secs: self.metadata.estimated_duration_secs,
            risk_level: self.metadata.risk_level,
            can_rollback: self.rollback.is_available,
            requires_user_action: !self.unresolved_confirmations().is_empty(),
        }
    }
}

/// Snapshot counters exposed to UI-facing collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanSummary {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub pending_steps: usize,
    pub total_file_changes: usize,
    pub completed_file_changes: usize,
    pub estimated_duration_secs: u64,
    pub risk_level: RiskLevel,
    pub can_rollback: bool,
    pub requires_user_action: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_change::{FileChange, FileOperation};
    use crate::step::{StepKind, StepMetadata};

    fn change(path: &str) -> FileChange {
        FileChange::new(FileOperation::Create, path, Vec::new(), 16, "rust").unwrap()
    }

    fn two_step_plan() -> (ActionPlan, Uuid, Uuid) {
        let mut plan = ActionPlan::new("Refactor", "Refactor the button module");
        let s1 = PlanStep::new(StepKind::Backup, "Backup", "Snapshot files");
        let s1_id = s1.id;
        let s2 = PlanStep::new(StepKind::FileOperation, "Apply", "Write changes")
            .with_dependencies(vec![s1_id])
            .with_file_changes(vec![change("src/a.rs")]);
        let s2_id = s2.id;
        plan.add_step(s1).unwrap();
        plan.add_step(s2).unwrap();
        (plan, s1_id, s2_id)
    }

    #[test]
    fn new_plan_starts_planning() {
        let plan = ActionPlan::new("Title", "Description");
        assert_eq!(plan.status, PlanStatus::Planning);
        assert!(plan.steps.is_empty());
        assert!(plan.error.is_none());
    }

    #[test]
    fn finalize_moves_to_pending_and_counts_files() {
        let (mut plan, _, _) = two_step_plan();
        plan.finalize().unwrap();
        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.metadata.total_files, 1);
    }

    #[test]
    fn add_step_after_finalize_is_rejected() {
        let (mut plan, _, _) = two_step_plan();
        plan.finalize().unwrap();
        let result = plan.add_step(PlanStep::new(StepKind::Cleanup, "Tidy", ""));
        assert!(matches!(result, Err(PlanError::InvalidTransition { .. })));
    }

    #[test]
    fn finalize_rejects_unknown_dependency() {
        let mut plan = ActionPlan::new("Bad", "Dangling dep");
        let step = PlanStep::new(StepKind::Test, "Test", "").with_dependencies(vec![Uuid::new_v4()]);
        plan.add_step(step).unwrap();
        assert!(matches!(
            plan.finalize(),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn finalize_rejects_dependency_cycle() {
        let mut plan = ActionPlan::new("Bad", "Cyclic");
        let mut s1 = PlanStep::new(StepKind::Analysis, "A", "");
        let mut s2 = PlanStep::new(StepKind::Analysis, "B", "");
        s1.dependencies = vec![s2.id];
        s2.dependencies = vec![s1.id];
        plan.add_step(s1).unwrap();
        plan.add_step(s2).unwrap();
        assert!(matches!(
            plan.finalize(),
            Err(PlanError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn execution_order_is_stable_for_independent_steps() {
        let mut plan = ActionPlan::new("Order", "");
        let a = PlanStep::new(StepKind::Analysis, "A", "");
        let b = PlanStep::new(StepKind::Analysis, "B", "");
        let c = PlanStep::new(StepKind::Analysis, "C", "");
        let ids = vec![a.id, b.id, c.id];
        for s in [a, b, c] {
            plan.add_step(s).unwrap();
        }
        // No dependencies: authored order is preserved.
        assert_eq!(plan.execution_order().unwrap(), ids);
    }

    #[test]
    fn execution_order_places_dependencies_first() {
        let mut plan = ActionPlan::new("Order", "");
        let dep = PlanStep::new(StepKind::Backup, "Backup", "");
        let dep_id = dep.id;
        let first = PlanStep::new(StepKind::FileOperation, "Apply", "")
            .with_dependencies(vec![dep_id]);
        let first_id = first.id;
        // Authored with the dependent step first.
        plan.add_step(first).unwrap();
        plan.add_step(dep).unwrap();
        assert_eq!(plan.execution_order().unwrap(), vec![dep_id, first_id]);
    }

    #[test]
    fn approve_all_is_idempotent() {
        let (mut plan, _, s2_id) = two_step_plan();
        plan.approve_all();
        let statuses: Vec<ExecutionStatus> = plan
            .step(s2_id)
            .unwrap()
            .file_changes
            .iter()
            .map(|fc| fc.status)
            .collect();
        plan.approve_all();
        let statuses_again: Vec<ExecutionStatus> = plan
            .step(s2_id)
            .unwrap()
            .file_changes
            .iter()
            .map(|fc| fc.status)
            .collect();
        assert_eq!(statuses, statuses_again);
        assert!(statuses
            .iter()
            .all(|s| *s == ExecutionStatus::Completed));
    }

    #[test]
    fn invalid_plan_transition_leaves_status_unchanged() {
        let (mut plan, _, _) = two_step_plan();
        let result = plan.transition(PlanStatus::Applied);
        assert!(matches!(result, Err(PlanError::InvalidTransition { .. })));
        assert_eq!(plan.status, PlanStatus::Planning);
    }

    #[test]
    fn transition_stamps_timeline() {
        let (mut plan, _, _) = two_step_plan();
        plan.finalize().unwrap();
        plan.transition(PlanStatus::Approved).unwrap();
        plan.transition(PlanStatus::Applying).unwrap();
        assert!(plan.timeline.started_at.is_some());
        plan.transition(PlanStatus::Applied).unwrap();
        assert!(plan.timeline.applied_at.is_some());
        plan.transition(PlanStatus::RolledBack).unwrap();
        assert!(plan.timeline.rolled_back_at.is_some());
    }

    #[test]
    fn unresolved_confirmations_lists_pending_confirmation_steps() {
        let mut plan = ActionPlan::new("Confirm", "");
        let gated = PlanStep::new(StepKind::FileOperation, "Gated", "").with_metadata(
            StepMetadata {
                requires_user_confirmation: true,
                ..StepMetadata::default()
            },
        );
        let gated_id = gated.id;
        plan.add_step(gated).unwrap();
        plan.add_step(PlanStep::new(StepKind::Test, "Free", "")).unwrap();
        assert_eq!(plan.unresolved_confirmations(), vec![gated_id]);

        plan.step_mut(gated_id).unwrap().approve_manually().unwrap();
        assert!(plan.unresolved_confirmations().is_empty());
    }

    #[test]
    fn first_recorded_failure_wins() {
        let (mut plan, s1_id, _) = two_step_plan();
        plan.record_failure(PlanFailure {
            code: "STEP_FAILED".to_string(),
            message: "first".to_string(),
            step_id: Some(s1_id),
            file_change_id: None,
        });
        plan.record_failure(PlanFailure {
            code: "STEP_FAILED".to_string(),
            message: "second".to_string(),
            step_id: None,
            file_change_id: None,
        });
        assert_eq!(plan.error.as_ref().unwrap().message, "first");
        assert_eq!(plan.error.as_ref().unwrap().step_id, Some(s1_id));
    }

    #[test]
    fn summary_counts_steps_and_changes() {
        let (mut plan, s1_id, _) = two_step_plan();
        plan.finalize().unwrap();
        let step = plan.step_mut(s1_id).unwrap();
        step.begin().unwrap();
        step.complete().unwrap();

        let summary = plan.summary();
        assert_eq!(summary.total_steps, 2);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.pending_steps, 1);
        assert_eq!(summary.total_file_changes, 1);
        assert_eq!(summary.completed_file_changes, 0);
        assert!(!summary.requires_user_action);
    }

    #[test]
    fn serialization_round_trip_preserves_order_and_statuses() {
        let (mut plan, s1_id, s2_id) = two_step_plan();
        plan.finalize().unwrap();
        let json = serde_json::to_string(&plan).unwrap();
        let restored: ActionPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, plan.id);
        assert_eq!(restored.status, plan.status);
        let ids: Vec<Uuid> = restored.steps.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![s1_id, s2_id]);
        assert_eq!(restored.steps[1].dependencies, vec![s1_id]);
    }
}
