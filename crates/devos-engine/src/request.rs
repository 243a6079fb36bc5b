// request.rs — Plan intake: AI-response content → ActionPlan.
//
// The AI collaborator authors plans with its own short step keys
// ("step1", "step2") and dependency lists over those keys. This module
// deserializes that shape, remaps keys to fresh UUIDs, builds the typed
// plan, and finalizes it — so dependency-graph validation (unknown keys,
// cycles) happens exactly once, at creation time.

use std::collections::HashMap;

use serde::Deserialize;
use uuid::Uuid;

use devos_diff::DiffChunk;
use devos_plan::{
    ActionPlan, FileChange, FileOperation, PlanError, PlanStep, Priority, RiskLevel, StepKind,
    StepMetadata, ValidationSpec,
};

/// An AI-authored plan, as received from the inference collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanRequest {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    pub steps: Vec<StepRequest>,
    #[serde(default)]
    pub validation: ValidationSpec,
    #[serde(default)]
    pub requires_git: bool,
    #[serde(default)]
    pub requires_build: bool,
    #[serde(default)]
    pub requires_test: bool,
    /// Opaque restore point named by the host (e.g., a commit hash).
    #[serde(default)]
    pub rollback_point: Option<String>,
}

/// One AI-authored step, keyed by an author-chosen id.
#[derive(Debug, Clone, Deserialize)]
pub struct StepRequest {
    /// Author-side key, referenced by `depends_on` of other steps.
    pub id: String,
    pub kind: StepKind,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub file_changes: Vec<FileChangeRequest>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub requires_user_confirmation: bool,
    #[serde(default = "default_can_rollback")]
    pub can_rollback: bool,
}

fn default_can_rollback() -> bool {
    true
}

/// One AI-authored file change.
#[derive(Debug, Clone, Deserialize)]
pub struct FileChangeRequest {
    pub operation: FileOperation,
    pub file_path: String,
    #[serde(default)]
    pub new_path: Option<String>,
    #[serde(default)]
    pub diff: Vec<DiffChunk>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default = "default_file_type")]
    pub file_type: String,
}

fn default_file_type() -> String {
    "text".to_string()
}

/// Build a finalized (pending) ActionPlan from an AI response.
///
/// Author keys must be unique and every `depends_on` entry must name a
/// key in the request; violations are `InvalidArgument`. Cycles are
/// caught by finalization as `DependencyCycle`.
pub fn build_plan(request: PlanRequest) -> Result<ActionPlan, PlanError> {
    let mut plan = ActionPlan::new(request.title, request.description);
    if let Some(priority) = request.priority {
        plan.priority = priority;
    }
    plan.validation = request.validation;
    plan.metadata.requires_git = request.requires_git;
    plan.metadata.requires_build = request.requires_build;
    plan.metadata.requires_test = request.requires_test;
    plan.rollback.rollback_point = request.rollback_point;

    // First pass: assign a UUID per author key.
    let mut key_to_id: HashMap<String, Uuid> = HashMap::new();
    let mut keyed_steps = Vec::with_capacity(request.steps.len());
    for step_request in request.steps {
        let step = build_step(&step_request)?;
        if key_to_id.insert(step_request.id.clone(), step.id).is_some() {
            return Err(PlanError::InvalidArgument(format!(
                "duplicate step key: {}",
                step_request.id
            )));
        }
        keyed_steps.push((step_request, step));
    }

    // Second pass: resolve dependency keys against the full map.
    let mut total_duration = 0u64;
    let mut max_risk = RiskLevel::Low;
    for (step_request, mut step) in keyed_steps {
        let mut dependencies = Vec::with_capacity(step_request.depends_on.len());
        for dep_key in &step_request.depends_on {
            let dep_id = key_to_id.get(dep_key).ok_or_else(|| {
                PlanError::InvalidArgument(format!(
                    "step {} depends on unknown key {dep_key}",
                    step_request.id
                ))
            })?;
            dependencies.push(*dep_id);
        }
        step.dependencies = dependencies;

        total_duration += step.metadata.estimated_duration_secs.unwrap_or(0);
        if step.metadata.risk_level > max_risk {
            max_risk = step.metadata.risk_level;
        }
        plan.add_step(step)?;
    }

    plan.metadata.estimated_duration_secs = total_duration;
    plan.metadata.risk_level = max_risk;
    plan.rollback.is_available = plan
        .steps
        .iter()
        .all(|s| s.metadata.can_rollback);

    plan.finalize()?;
    Ok(plan)
}

fn build_step(request: &StepRequest) -> Result<PlanStep, PlanError> {
    let mut file_changes = Vec::with_capacity(request.file_changes.len());
    for fc_request in &request.file_changes {
        let mut fc = FileChange::new(
            fc_request.operation,
            fc_request.file_path.clone(),
            fc_request.diff.clone(),
            fc_request.size_bytes,
            fc_request.file_type.clone(),
        )?;
        if let Some(new_path) = &fc_request.new_path {
            fc = fc.with_new_path(new_path.clone())?;
        } else if fc_request.operation.requires_new_path() {
            return Err(PlanError::InvalidArgument(format!(
                "{:?} of {} requires a new_path",
                fc_request.operation, fc_request.file_path
            )));
        }
        file_changes.push(fc);
    }

    let mut step = PlanStep::new(request.kind, request.title.clone(), request.description.clone())
        .with_file_changes(file_changes)
        .with_metadata(StepMetadata {
            estimated_duration_secs: request.estimated_duration_secs,
            risk_level: request.risk_level.unwrap_or(RiskLevel::Low),
            requires_user_confirmation: request.requires_user_confirmation,
            can_rollback: request.can_rollback,
        });
    if let Some(priority) = request.priority {
        step = step.with_priority(priority);
    }
    Ok(step)
}
