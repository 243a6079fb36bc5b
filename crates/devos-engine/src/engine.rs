// engine.rs — ExecutionEngine: drives an ActionPlan through its lifecycle.
//
// The engine is the single owner of plan, step, and file-change status.
// Collaborators request transitions (approve, reject, execute, rollback);
// the engine validates each one against the status graphs, performs the
// side effects through the BackingStore, and records every transition in
// the audit journal.
//
// Concurrency model:
// - One engine instance per plan. Plan and journal live behind one mutex;
//   observers read cloned snapshots.
// - executePlan/rollbackPlan are mutually exclusive via a separate
//   execution lock. A concurrent call fails immediately with PlanBusy —
//   calls are never queued.
// - Cancellation is cooperative: a flag checked between steps, never
//   mid-file-change, so a change is never left half-applied by a cancel.
//
// Failure policy: per-file-change failures are captured into state
// (error_message → step failed → plan failure record + audit entry) and
// never raised out of executePlan. Structural errors (illegal transition,
// busy, unmet approval gate) are returned synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use uuid::Uuid;

use devos_audit::{AuditAction, AuditEntry, AuditJournal, AuditStatus};
use devos_plan::{
    ActionPlan, ExecutionStatus, FileChange, PlanError, PlanFailure, PlanStatus, PlanSummary,
};

use crate::error::EngineError;
use crate::request::{self, PlanRequest};
use crate::store::BackingStore;
use crate::validator::{PreconditionValidator, ValidationReport, ValidatorError};

/// Plan-failure code recorded when a step fails during execution.
const CODE_EXECUTION_FAILED: &str = "EXECUTION_FAILED";
/// Failure code recorded on the file change when the backing store rejects an apply.
const CODE_BACKING_STORE_FAILURE: &str = "BACKING_STORE_FAILURE";
/// Plan-failure code recorded when execution is cancelled between steps.
const CODE_PLAN_CANCELLED: &str = "PLAN_CANCELLED";
/// Plan-failure code recorded when a best-effort rollback could not restore a step.
const CODE_ROLLBACK_FAILED: &str = "ROLLBACK_FAILED";

/// Mutable engine state: the plan and its audit trail, kept together so
/// a transition and its audit entry land under one lock.
struct EngineState {
    plan: ActionPlan,
    journal: AuditJournal,
}

/// Outcome of applying one file change during step execution.
enum ChangeOutcome {
    /// Applied (or already applied on a resumed run).
    Applied,
    /// Nothing to do for this change in its current state.
    Skipped,
    /// The change ended failed; the step must fail fast.
    Failed { file_change_id: Uuid, message: String },
}

/// The action-plan execution engine.
///
/// Generic over the backing store and the precondition validator so
/// hosts can inject real adapters and tests can inject mocks.
pub struct ExecutionEngine<S: BackingStore, V: PreconditionValidator> {
    project_id: String,
    state: Mutex<EngineState>,
    store: Mutex<S>,
    validator: V,
    /// Mutual exclusion for execute/rollback. try-acquired, never queued.
    exec_lock: Mutex<()>,
    cancel_requested: AtomicBool,
}

impl<S: BackingStore, V: PreconditionValidator> ExecutionEngine<S, V> {
    /// Build a plan from an AI response and take ownership of its
    /// lifecycle. The plan lands in `pending` with `plan_created` audited.
    pub fn new(
        project_id: impl Into<String>,
        request: PlanRequest,
        store: S,
        validator: V,
    ) -> Result<Self, EngineError> {
        let project_id = project_id.into();
        let plan = request::build_plan(request)?;

        let mut journal = AuditJournal::new();
        journal.append(AuditEntry::new(
            AuditAction::AiResponse,
            AuditStatus::Success,
            &project_id,
            format!("AI proposed plan: {}", plan.title),
        ))?;
        journal.append(AuditEntry::new(
            AuditAction::PlanCreated,
            AuditStatus::Success,
            &project_id,
            format!("Plan created: {} ({} steps)", plan.title, plan.steps.len()),
        ))?;
        tracing::info!("plan {} created with {} steps", plan.id, plan.steps.len());

        Ok(Self {
            project_id,
            state: Mutex::new(EngineState { plan, journal }),
            store: Mutex::new(store),
            validator,
            exec_lock: Mutex::new(()),
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// Snapshot of the current plan state.
    pub fn plan(&self) -> ActionPlan {
        self.state().plan.clone()
    }

    /// Aggregated counters for observers.
    pub fn summary(&self) -> PlanSummary {
        self.state().plan.summary()
    }

    /// Audit entries, newest first, capped at the journal bound.
    pub fn audit_logs(&self) -> Vec<AuditEntry> {
        self.state().journal.snapshot()
    }

    /// Run a closure against the backing store, for host-side inspection.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let guard = self.store();
        f(&guard)
    }

    /// Record reviewer approval of one file change. Idempotent.
    pub fn approve_file_change(
        &self,
        step_id: Uuid,
        file_change_id: Uuid,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        let fc = state
            .plan
            .step_mut(step_id)?
            .file_change_mut(file_change_id)?;
        fc.approve();
        let path = fc.file_path.clone();
        state.journal.append(
            AuditEntry::new(
                AuditAction::FileApproved,
                AuditStatus::Success,
                &self.project_id,
                format!("Approved file change: {path}"),
            )
            .with_step(step_id)
            .with_file_change(file_change_id)
            .with_files(vec![path]),
        )?;
        Ok(())
    }

    /// Record reviewer rejection of one file change. Valid only while
    /// the change is pending.
    pub fn reject_file_change(
        &self,
        step_id: Uuid,
        file_change_id: Uuid,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        let fc = state
            .plan
            .step_mut(step_id)?
            .file_change_mut(file_change_id)?;
        fc.reject()?;
        let path = fc.file_path.clone();
        state.journal.append(
            AuditEntry::new(
                AuditAction::FileRejected,
                AuditStatus::Success,
                &self.project_id,
                format!("Rejected file change: {path}"),
            )
            .with_step(step_id)
            .with_file_change(file_change_id)
            .with_files(vec![path]),
        )?;
        Ok(())
    }

    /// Bulk reviewer approval of every pending file change. Idempotent.
    pub fn approve_all(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        state.plan.approve_all();
        let paths: Vec<String> = state
            .plan
            .steps
            .iter()
            .flat_map(|s| &s.file_changes)
            .map(|fc| fc.file_path.clone())
            .collect();
        let count = paths.len();
        state.journal.append(
            AuditEntry::new(
                AuditAction::FileApproved,
                AuditStatus::Success,
                &self.project_id,
                format!("Bulk-approved {count} file change(s)"),
            )
            .with_files(paths),
        )?;
        Ok(())
    }

    /// Reset a failed file change to pending so execution can resume.
    /// If its owning step failed, the step is reset too. Resumption is
    /// explicit: nothing re-executes until `execute_plan` is re-invoked.
    pub fn retry_file_change(
        &self,
        step_id: Uuid,
        file_change_id: Uuid,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        let step = state.plan.step_mut(step_id)?;
        step.file_change_mut(file_change_id)?.retry()?;
        if step.status == ExecutionStatus::Failed {
            step.reset_for_retry()?;
        }
        Ok(())
    }

    /// Manual override for a confirmation-required step: approve it
    /// outright, bypassing automatic execution.
    pub fn approve_step(&self, step_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state();
        let step = state.plan.step_mut(step_id)?;
        step.approve_manually()?;
        let title = step.title.clone();
        state.journal.append(
            AuditEntry::new(
                AuditAction::StepCompleted,
                AuditStatus::Success,
                &self.project_id,
                format!("Step manually approved: {title}"),
            )
            .with_step(step_id),
        )?;
        Ok(())
    }

    /// Manual override for a confirmation-required step: reject it.
    pub fn reject_step(&self, step_id: Uuid) -> Result<(), EngineError> {
        let mut state = self.state();
        let step = state.plan.step_mut(step_id)?;
        step.reject_manually()?;
        let title = step.title.clone();
        state.journal.append(
            AuditEntry::new(
                AuditAction::StepFailed,
                AuditStatus::Failed,
                &self.project_id,
                format!("Step manually rejected: {title}"),
            )
            .with_step(step_id),
        )?;
        Ok(())
    }

    /// Update a running step's progress percentage.
    pub fn update_step_progress(&self, step_id: Uuid, pct: u8) -> Result<(), EngineError> {
        let mut state = self.state();
        state.plan.step_mut(step_id)?.update_progress(pct)?;
        Ok(())
    }

    /// Move the plan from pending to approved.
    ///
    /// Guard: every confirmation-required step must be resolved, and so
    /// must every pending file change belonging to one. Unresolved items
    /// block with `PendingApprovalRequired`.
    pub fn approve_plan(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        let blocking = confirmation_blockers(&state.plan);
        if blocking > 0 {
            return Err(EngineError::PendingApprovalRequired { blocking });
        }
        state.plan.transition(PlanStatus::Approved)?;
        let title = state.plan.title.clone();
        state.journal.append(AuditEntry::new(
            AuditAction::PlanApproved,
            AuditStatus::Success,
            &self.project_id,
            format!("Approved action plan: {title}"),
        ))?;
        Ok(())
    }

    /// Move the plan from pending to rejected. Terminal.
    pub fn reject_plan(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        state.plan.transition(PlanStatus::Rejected)?;
        let title = state.plan.title.clone();
        state.journal.append(AuditEntry::new(
            AuditAction::PlanRejected,
            AuditStatus::Success,
            &self.project_id,
            format!("Rejected action plan: {title}"),
        ))?;
        Ok(())
    }

    /// Check the dependency graph and every precondition.
    ///
    /// Fails closed: an unreachable validator is `ValidationUnavailable`,
    /// never a silent pass.
    pub fn validate_plan(&self) -> Result<ValidationReport, EngineError> {
        let pre_conditions = {
            let state = self.state();
            state.plan.execution_order()?;
            state.plan.validation.pre_conditions.clone()
        };
        let mut violated = Vec::new();
        for condition in pre_conditions {
            match self.validator.check(&condition) {
                Ok(true) => {}
                Ok(false) => violated.push(condition),
                Err(ValidatorError::Unavailable(msg)) => {
                    return Err(EngineError::ValidationUnavailable(msg));
                }
            }
        }
        Ok(ValidationReport {
            passed: violated.is_empty(),
            violated,
        })
    }

    /// Request cooperative cancellation of an in-flight execution.
    /// Checked between steps only; already-completed steps keep their
    /// status and are not rolled back implicitly.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Execute the plan: dependency-ordered, fail-fast within a step,
    /// cascade-skip across failed dependencies.
    ///
    /// Returns Ok even when steps fail — callers inspect plan state and
    /// the audit trail afterward. Errors are structural only.
    pub fn execute_plan(&self) -> Result<(), EngineError> {
        let _exec = self.try_exec_lock()?;
        self.cancel_requested.store(false, Ordering::SeqCst);
        let started = Instant::now();

        let order = {
            let mut state = self.state();
            match state.plan.status {
                PlanStatus::Approved => state.plan.transition(PlanStatus::Applying)?,
                // Resuming after a partial failure or cancellation.
                PlanStatus::Applying => {}
                other => {
                    return Err(PlanError::InvalidTransition {
                        from: other.to_string(),
                        to: PlanStatus::Applying.to_string(),
                    }
                    .into());
                }
            }
            state.plan.execution_order()?
        };

        let mut cancelled = false;
        for step_id in order {
            if self.cancel_requested.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            self.run_step(step_id)?;
        }

        if cancelled {
            self.cancel_remaining_steps()?;
        }

        let mut state = self.state();
        let any_failed = state
            .plan
            .steps
            .iter()
            .any(|s| s.status == ExecutionStatus::Failed);
        if !any_failed && !cancelled {
            state.plan.transition(PlanStatus::Applied)?;
            let title = state.plan.title.clone();
            state.journal.append(
                AuditEntry::new(
                    AuditAction::PlanExecuted,
                    AuditStatus::Success,
                    &self.project_id,
                    format!("Applied action plan: {title}"),
                )
                .with_duration_ms(started.elapsed().as_millis() as u64),
            )?;
            tracing::info!("plan {} applied", state.plan.id);
        }
        // On failure the plan stays in applying with its failure record;
        // rollback is always an explicit follow-up, never automatic.
        Ok(())
    }

    /// Execute one step, if it is ready. Unlike `execute_plan`, an
    /// unready step is an error here rather than a cascade skip.
    pub fn execute_step(&self, step_id: Uuid) -> Result<(), EngineError> {
        let _exec = self.try_exec_lock()?;
        {
            let mut state = self.state();
            let completed = state.plan.completed_step_ids();
            let step = state.plan.step(step_id)?;
            if !step.can_execute(&completed) {
                return Err(EngineError::StepNotReady { step_id });
            }
            match state.plan.status {
                PlanStatus::Approved => state.plan.transition(PlanStatus::Applying)?,
                PlanStatus::Applying => {}
                other => {
                    return Err(PlanError::InvalidTransition {
                        from: other.to_string(),
                        to: PlanStatus::Applying.to_string(),
                    }
                    .into());
                }
            }
        }
        self.run_step(step_id)
    }

    /// Roll the plan back, best-effort: reverse execution order across
    /// steps, reverse change order within a step. A change without a
    /// backup aborts its own step's rollback and records ROLLBACK_FAILED,
    /// but independent steps still roll back.
    pub fn rollback_plan(&self) -> Result<(), EngineError> {
        let _exec = self.try_exec_lock()?;

        let order = {
            let state = self.state();
            match state.plan.status {
                PlanStatus::Applied | PlanStatus::Applying => {}
                other => {
                    return Err(PlanError::InvalidTransition {
                        from: other.to_string(),
                        to: PlanStatus::RolledBack.to_string(),
                    }
                    .into());
                }
            }
            state.plan.execution_order()?
        };

        for step_id in order.into_iter().rev() {
            self.rollback_step(step_id)?;
        }

        let mut state = self.state();
        state.plan.transition(PlanStatus::RolledBack)?;
        state.plan.rollback.is_available = false;
        let title = state.plan.title.clone();
        state.journal.append(AuditEntry::new(
            AuditAction::PlanRolledBack,
            AuditStatus::RolledBack,
            &self.project_id,
            format!("Rolled back action plan: {title}"),
        ))?;
        tracing::info!("plan {} rolled back", state.plan.id);
        Ok(())
    }

    // ---- internals ----

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_exec_lock(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        match self.exec_lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(EngineError::PlanBusy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Run one step: cascade-skip if a dependency failed, otherwise
    /// apply its file changes sequentially, fail-fast.
    fn run_step(&self, step_id: Uuid) -> Result<(), EngineError> {
        let change_ids: Vec<Uuid> = {
            let mut state = self.state();
            let completed = state.plan.completed_step_ids();
            let step = state.plan.step(step_id)?;
            if step.is_settled() {
                // Resumed run: already resolved (completed, failed,
                // cancelled, or manually overridden).
                return Ok(());
            }
            if !step.can_execute(&completed) {
                // An upstream dependency failed or was skipped. Skip this
                // step without halting independent branches.
                let step = state.plan.step_mut(step_id)?;
                step.cancel()?;
                let title = step.title.clone();
                state.journal.append(
                    AuditEntry::new(
                        AuditAction::StepCancelled,
                        AuditStatus::Failed,
                        &self.project_id,
                        format!("Step skipped (dependency failed): {title}"),
                    )
                    .with_step(step_id),
                )?;
                return Ok(());
            }
            let step = state.plan.step_mut(step_id)?;
            step.begin()?;
            let title = step.title.clone();
            let ids: Vec<Uuid> = step.file_changes.iter().map(|fc| fc.id).collect();
            state.journal.append(
                AuditEntry::new(
                    AuditAction::StepStarted,
                    AuditStatus::Running,
                    &self.project_id,
                    format!("Step started: {title}"),
                )
                .with_step(step_id),
            )?;
            ids
        };

        let total = change_ids.len();
        let mut failure: Option<(Uuid, String)> = None;
        for (index, change_id) in change_ids.into_iter().enumerate() {
            match self.apply_change(step_id, change_id)? {
                ChangeOutcome::Applied | ChangeOutcome::Skipped => {}
                ChangeOutcome::Failed {
                    file_change_id,
                    message,
                } => {
                    // Fail fast: remaining changes in this step are not attempted.
                    failure = Some((file_change_id, message));
                    break;
                }
            }
            let pct = ((index + 1) * 100 / total) as u8;
            self.state().plan.step_mut(step_id)?.update_progress(pct)?;
        }

        let mut state = self.state();
        let step = state.plan.step_mut(step_id)?;
        let title = step.title.clone();
        match failure {
            None => {
                step.complete()?;
                state.journal.append(
                    AuditEntry::new(
                        AuditAction::StepCompleted,
                        AuditStatus::Success,
                        &self.project_id,
                        format!("Step completed: {title}"),
                    )
                    .with_step(step_id),
                )?;
            }
            Some((file_change_id, message)) => {
                step.fail()?;
                state.plan.record_failure(PlanFailure {
                    code: CODE_EXECUTION_FAILED.to_string(),
                    message: message.clone(),
                    step_id: Some(step_id),
                    file_change_id: Some(file_change_id),
                });
                // One error-kind entry per transition: the failing change
                // already appended its own Error entry, so the step level
                // records only the step_failed transition.
                state.journal.append(
                    AuditEntry::new(
                        AuditAction::StepFailed,
                        AuditStatus::Failed,
                        &self.project_id,
                        format!("Step failed: {title}"),
                    )
                    .with_step(step_id)
                    .with_file_change(file_change_id)
                    .with_error(CODE_EXECUTION_FAILED, message),
                )?;
                tracing::warn!("step {} failed", step_id);
            }
        }
        Ok(())
    }

    /// Apply one file change through the backing store.
    ///
    /// Pending changes walk the full machine (backup → running →
    /// completed/failed). Reviewer-approved changes are already
    /// `completed`; the engine backfills backup + apply and stamps
    /// `applied_at` without re-walking the machine.
    fn apply_change(&self, step_id: Uuid, change_id: Uuid) -> Result<ChangeOutcome, EngineError> {
        let snapshot: FileChange = self
            .state()
            .plan
            .step(step_id)?
            .file_change(change_id)?
            .clone();

        match snapshot.status {
            ExecutionStatus::Failed => {
                // Reviewer-rejected: the step fails fast when it reaches it.
                Ok(ChangeOutcome::Failed {
                    file_change_id: change_id,
                    message: snapshot
                        .error_message
                        .unwrap_or_else(|| "rejected by reviewer".to_string()),
                })
            }
            ExecutionStatus::Completed if snapshot.applied_at.is_some() => {
                Ok(ChangeOutcome::Applied)
            }
            ExecutionStatus::Completed => self.apply_approved_change(step_id, &snapshot),
            ExecutionStatus::Pending => self.apply_pending_change(step_id, snapshot),
            // Cancelled or mid-rollback: nothing to apply.
            _ => Ok(ChangeOutcome::Skipped),
        }
    }

    fn apply_pending_change(
        &self,
        step_id: Uuid,
        mut snapshot: FileChange,
    ) -> Result<ChangeOutcome, EngineError> {
        let change_id = snapshot.id;

        // Backups are taken for every operation, create included, so
        // best-effort rollback can undo creations too.
        let backup = self.store().backup(&snapshot);
        match backup {
            Ok(token) => {
                snapshot.set_backup_ref(token.clone());
                let mut state = self.state();
                state
                    .plan
                    .step_mut(step_id)?
                    .file_change_mut(change_id)?
                    .set_backup_ref(token.clone());
                state.journal.append(
                    AuditEntry::new(
                        AuditAction::BackupCreated,
                        AuditStatus::Success,
                        &self.project_id,
                        format!("Backup created for {}", snapshot.file_path),
                    )
                    .with_step(step_id)
                    .with_file_change(change_id)
                    .with_metadata(serde_json::json!({ "backup_ref": token })),
                )?;
            }
            Err(err) => {
                let message = format!("backup failed: {err}");
                let mut state = self.state();
                let fc = state.plan.step_mut(step_id)?.file_change_mut(change_id)?;
                fc.mark_running()?;
                fc.mark_failed(message.clone())?;
                self.audit_change_failure(&mut state, step_id, change_id, &message)?;
                return Ok(ChangeOutcome::Failed {
                    file_change_id: change_id,
                    message,
                });
            }
        }

        self.state()
            .plan
            .step_mut(step_id)?
            .file_change_mut(change_id)?
            .mark_running()?;

        let applied = self.store().apply(&snapshot);
        let mut state = self.state();
        match applied {
            Ok(()) => {
                let fc = state.plan.step_mut(step_id)?.file_change_mut(change_id)?;
                fc.mark_completed()?;
                let path = fc.file_path.clone();
                state.journal.append(
                    AuditEntry::new(
                        AuditAction::FileApplied,
                        AuditStatus::Success,
                        &self.project_id,
                        format!("Applied file change: {path}"),
                    )
                    .with_step(step_id)
                    .with_file_change(change_id)
                    .with_files(vec![path]),
                )?;
                Ok(ChangeOutcome::Applied)
            }
            Err(err) => {
                let message = err.to_string();
                state
                    .plan
                    .step_mut(step_id)?
                    .file_change_mut(change_id)?
                    .mark_failed(message.clone())?;
                self.audit_change_failure(&mut state, step_id, change_id, &message)?;
                Ok(ChangeOutcome::Failed {
                    file_change_id: change_id,
                    message,
                })
            }
        }
    }

    /// Apply a reviewer-approved (already `completed`) change. The status
    /// machine is not re-walked; success stamps `applied_at`, failure is
    /// captured in `error_message` and fails the step.
    fn apply_approved_change(
        &self,
        step_id: Uuid,
        snapshot: &FileChange,
    ) -> Result<ChangeOutcome, EngineError> {
        let change_id = snapshot.id;

        if snapshot.backup_ref.is_none() {
            match self.store().backup(snapshot) {
                Ok(token) => {
                    let mut state = self.state();
                    state
                        .plan
                        .step_mut(step_id)?
                        .file_change_mut(change_id)?
                        .set_backup_ref(token.clone());
                    state.journal.append(
                        AuditEntry::new(
                            AuditAction::BackupCreated,
                            AuditStatus::Success,
                            &self.project_id,
                            format!("Backup created for {}", snapshot.file_path),
                        )
                        .with_step(step_id)
                        .with_file_change(change_id)
                        .with_metadata(serde_json::json!({ "backup_ref": token })),
                    )?;
                }
                Err(err) => {
                    let message = format!("backup failed: {err}");
                    let mut state = self.state();
                    state
                        .plan
                        .step_mut(step_id)?
                        .file_change_mut(change_id)?
                        .error_message = Some(message.clone());
                    self.audit_change_failure(&mut state, step_id, change_id, &message)?;
                    return Ok(ChangeOutcome::Failed {
                        file_change_id: change_id,
                        message,
                    });
                }
            }
        }

        let applied = self.store().apply(snapshot);
        let mut state = self.state();
        match applied {
            Ok(()) => {
                let fc = state.plan.step_mut(step_id)?.file_change_mut(change_id)?;
                fc.stamp_applied();
                let path = fc.file_path.clone();
                state.journal.append(
                    AuditEntry::new(
                        AuditAction::FileApplied,
                        AuditStatus::Success,
                        &self.project_id,
                        format!("Applied file change: {path}"),
                    )
                    .with_step(step_id)
                    .with_file_change(change_id)
                    .with_files(vec![path]),
                )?;
                Ok(ChangeOutcome::Applied)
            }
            Err(err) => {
                let message = err.to_string();
                state
                    .plan
                    .step_mut(step_id)?
                    .file_change_mut(change_id)?
                    .error_message = Some(message.clone());
                self.audit_change_failure(&mut state, step_id, change_id, &message)?;
                Ok(ChangeOutcome::Failed {
                    file_change_id: change_id,
                    message,
                })
            }
        }
    }

    fn audit_change_failure(
        &self,
        state: &mut EngineState,
        step_id: Uuid,
        change_id: Uuid,
        message: &str,
    ) -> Result<(), EngineError> {
        state.journal.append(
            AuditEntry::new(
                AuditAction::Error,
                AuditStatus::Failed,
                &self.project_id,
                format!("File change failed: {message}"),
            )
            .with_step(step_id)
            .with_file_change(change_id)
            .with_error(CODE_BACKING_STORE_FAILURE, message),
        )?;
        Ok(())
    }

    /// Mark every still-pending step cancelled after a cooperative
    /// cancellation and record the plan-level failure.
    fn cancel_remaining_steps(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        let pending: Vec<Uuid> = state
            .plan
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Pending)
            .map(|s| s.id)
            .collect();
        for step_id in pending {
            let step = state.plan.step_mut(step_id)?;
            step.cancel()?;
            let title = step.title.clone();
            state.journal.append(
                AuditEntry::new(
                    AuditAction::StepCancelled,
                    AuditStatus::Failed,
                    &self.project_id,
                    format!("Step cancelled: {title}"),
                )
                .with_step(step_id),
            )?;
        }
        state.plan.record_failure(PlanFailure {
            code: CODE_PLAN_CANCELLED.to_string(),
            message: "execution cancelled between steps".to_string(),
            step_id: None,
            file_change_id: None,
        });
        tracing::info!("plan {} execution cancelled", state.plan.id);
        Ok(())
    }

    /// Best-effort rollback of one step: reverse change order, abort
    /// this step (but only this step) on the first unrecoverable change.
    fn rollback_step(&self, step_id: Uuid) -> Result<(), EngineError> {
        let (can_rollback, change_ids): (bool, Vec<Uuid>) = {
            let state = self.state();
            let step = state.plan.step(step_id)?;
            (
                step.metadata.can_rollback,
                step.file_changes.iter().rev().map(|fc| fc.id).collect(),
            )
        };
        if !can_rollback {
            return Ok(());
        }

        for change_id in change_ids {
            let snapshot: FileChange = self
                .state()
                .plan
                .step(step_id)?
                .file_change(change_id)?
                .clone();
            // Only applied changes are undone.
            if snapshot.status != ExecutionStatus::Completed || snapshot.applied_at.is_none() {
                continue;
            }

            let backup_ref = match &snapshot.backup_ref {
                Some(backup_ref) => backup_ref.clone(),
                None => {
                    self.record_rollback_failure(
                        step_id,
                        change_id,
                        &format!("no backup available for {}", snapshot.file_path),
                    )?;
                    // Abort this step's rollback; independent steps continue.
                    return Ok(());
                }
            };

            self.state()
                .plan
                .step_mut(step_id)?
                .file_change_mut(change_id)?
                .rollback_begin()?;

            let restored = self.store().restore(&backup_ref);
            let mut state = self.state();
            match restored {
                Ok(()) => {
                    let fc = state.plan.step_mut(step_id)?.file_change_mut(change_id)?;
                    fc.rollback_finish()?;
                    let path = fc.file_path.clone();
                    state.journal.append(
                        AuditEntry::new(
                            AuditAction::FileRollback,
                            AuditStatus::RolledBack,
                            &self.project_id,
                            format!("Rolled back file change: {path}"),
                        )
                        .with_step(step_id)
                        .with_file_change(change_id)
                        .with_files(vec![path]),
                    )?;
                }
                Err(err) => {
                    let message = format!("restore failed: {err}");
                    state
                        .plan
                        .step_mut(step_id)?
                        .file_change_mut(change_id)?
                        .error_message = Some(message.clone());
                    drop(state);
                    self.record_rollback_failure(step_id, change_id, &message)?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn record_rollback_failure(
        &self,
        step_id: Uuid,
        change_id: Uuid,
        message: &str,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        // Rollback failures overwrite earlier apply-phase records: the
        // caller needs to see that the restore itself went wrong.
        state.plan.error = Some(PlanFailure {
            code: CODE_ROLLBACK_FAILED.to_string(),
            message: message.to_string(),
            step_id: Some(step_id),
            file_change_id: Some(change_id),
        });
        state.journal.append(
            AuditEntry::new(
                AuditAction::Error,
                AuditStatus::Failed,
                &self.project_id,
                format!("Rollback failed: {message}"),
            )
            .with_step(step_id)
            .with_file_change(change_id)
            .with_error(CODE_ROLLBACK_FAILED, message),
        )?;
        tracing::warn!("rollback failure on step {}: {}", step_id, message);
        Ok(())
    }
}

/// Count the confirmation-required items that block plan approval:
/// pending confirmation steps plus pending file changes inside
/// confirmation-required steps.
fn confirmation_blockers(plan: &ActionPlan) -> usize {
    plan.steps
        .iter()
        .filter(|s| s.metadata.requires_user_confirmation)
        .map(|s| {
            let step_pending = usize::from(s.status == ExecutionStatus::Pending);
            let changes_pending = s
                .file_changes
                .iter()
                .filter(|fc| fc.status == ExecutionStatus::Pending)
                .count();
            step_pending + changes_pending
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    use crate::store::{MemoryStore, StoreError};
    use crate::validator::StaticValidator;

    fn simple_request(confirmation: bool) -> PlanRequest {
        let json = format!(
            r#"{{
                "title": "Refactor Button Component",
                "description": "Add variants",
                "steps": [
                    {{"id": "step1", "kind": "file_operation", "title": "Create button",
                      "description": "", "requires_user_confirmation": {confirmation},
                      "file_changes": [{{"operation": "create", "file_path": "src/button.rs"}}]}}
                ]
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn engine(
        request: PlanRequest,
    ) -> ExecutionEngine<MemoryStore, StaticValidator> {
        ExecutionEngine::new("project-1", request, MemoryStore::new(), StaticValidator::new())
            .unwrap()
    }

    #[test]
    fn new_engine_audits_creation() {
        let engine = engine(simple_request(false));
        let logs = engine.audit_logs();
        assert_eq!(logs.len(), 2);
        // Newest first.
        assert_eq!(logs[0].action, AuditAction::PlanCreated);
        assert_eq!(logs[1].action, AuditAction::AiResponse);
        assert_eq!(engine.plan().status, PlanStatus::Pending);
    }

    #[test]
    fn approve_plan_blocks_on_unresolved_confirmation() {
        let engine = engine(simple_request(true));
        let result = engine.approve_plan();
        assert!(matches!(
            result,
            Err(EngineError::PendingApprovalRequired { blocking: 2 })
        ));
        assert_eq!(engine.plan().status, PlanStatus::Pending);

        // Resolving the step unblocks approval.
        let step_id = engine.plan().steps[0].id;
        engine.approve_step(step_id).unwrap();
        engine.approve_plan().unwrap();
        assert_eq!(engine.plan().status, PlanStatus::Approved);
    }

    #[test]
    fn execute_requires_approved_plan() {
        let engine = engine(simple_request(false));
        let result = engine.execute_plan();
        assert!(matches!(
            result,
            Err(EngineError::Plan(PlanError::InvalidTransition { .. }))
        ));
    }

    #[test]
    fn execute_step_rejects_unready_step() {
        let json = r#"{
            "title": "Two", "description": "",
            "steps": [
                {"id": "a", "kind": "backup", "title": "A", "description": ""},
                {"id": "b", "kind": "test", "title": "B", "description": "", "depends_on": ["a"]}
            ]
        }"#;
        let engine = engine(serde_json::from_str(json).unwrap());
        engine.approve_plan().unwrap();
        let b_id = engine.plan().steps[1].id;
        let result = engine.execute_step(b_id);
        assert!(matches!(result, Err(EngineError::StepNotReady { .. })));
        assert_eq!(
            engine.plan().steps[1].status,
            ExecutionStatus::Pending
        );
    }

    #[test]
    fn validation_fails_closed_when_validator_unavailable() {
        let mut request = simple_request(false);
        request.validation.pre_conditions = vec!["Git repository is clean".to_string()];
        let engine = ExecutionEngine::new(
            "project-1",
            request,
            MemoryStore::new(),
            crate::validator::UnavailableValidator,
        )
        .unwrap();
        assert!(matches!(
            engine.validate_plan(),
            Err(EngineError::ValidationUnavailable(_))
        ));
    }

    #[test]
    fn validation_reports_violated_preconditions() {
        let mut request = simple_request(false);
        request.validation.pre_conditions = vec![
            "Git repository is clean".to_string(),
            "All tests pass currently".to_string(),
        ];
        let engine = ExecutionEngine::new(
            "project-1",
            request,
            MemoryStore::new(),
            StaticValidator::new().satisfy("Git repository is clean"),
        )
        .unwrap();
        let report = engine.validate_plan().unwrap();
        assert!(!report.passed);
        assert_eq!(report.violated, vec!["All tests pass currently".to_string()]);
    }

    /// Store whose applies block until released, for exercising the
    /// execution lock and cooperative cancellation.
    struct GatedStore {
        inner: MemoryStore,
        started_tx: mpsc::Sender<()>,
        release_rx: mpsc::Receiver<()>,
    }

    impl BackingStore for GatedStore {
        fn apply(&mut self, change: &FileChange) -> Result<(), StoreError> {
            self.started_tx.send(()).ok();
            self.release_rx.recv().ok();
            self.inner.apply(change)
        }

        fn backup(&mut self, change: &FileChange) -> Result<String, StoreError> {
            self.inner.backup(change)
        }

        fn restore(&mut self, backup_ref: &str) -> Result<(), StoreError> {
            self.inner.restore(backup_ref)
        }
    }

    #[test]
    fn concurrent_execute_fails_with_plan_busy() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = GatedStore {
            inner: MemoryStore::new(),
            started_tx,
            release_rx,
        };
        let engine = Arc::new(
            ExecutionEngine::new(
                "project-1",
                simple_request(false),
                store,
                StaticValidator::new(),
            )
            .unwrap(),
        );
        engine.approve_plan().unwrap();

        let background = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.execute_plan())
        };

        // Wait until the first apply is in flight, then race it.
        started_rx.recv().unwrap();
        assert!(matches!(engine.execute_plan(), Err(EngineError::PlanBusy)));
        assert!(matches!(engine.rollback_plan(), Err(EngineError::PlanBusy)));

        release_tx.send(()).unwrap();
        background.join().unwrap().unwrap();
        assert_eq!(engine.plan().status, PlanStatus::Applied);
    }

    #[test]
    fn cancel_skips_steps_not_yet_started() {
        let json = r#"{
            "title": "Two", "description": "",
            "steps": [
                {"id": "a", "kind": "file_operation", "title": "A", "description": "",
                 "file_changes": [{"operation": "create", "file_path": "a.rs"}]},
                {"id": "b", "kind": "file_operation", "title": "B", "description": "",
                 "file_changes": [{"operation": "create", "file_path": "b.rs"}]}
            ]
        }"#;
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let store = GatedStore {
            inner: MemoryStore::new(),
            started_tx,
            release_rx,
        };
        let engine = Arc::new(
            ExecutionEngine::new(
                "project-1",
                serde_json::from_str::<PlanRequest>(json).unwrap(),
                store,
                StaticValidator::new(),
            )
            .unwrap(),
        );
        engine.approve_plan().unwrap();

        let background = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.execute_plan())
        };

        // First step is mid-apply: request cancellation, then let it finish.
        started_rx.recv().unwrap();
        engine.cancel();
        release_tx.send(()).unwrap();
        background.join().unwrap().unwrap();

        let plan = engine.plan();
        // The in-flight step ran to completion; the next never started.
        assert_eq!(plan.steps[0].status, ExecutionStatus::Completed);
        assert_eq!(plan.steps[1].status, ExecutionStatus::Cancelled);
        assert_eq!(plan.status, PlanStatus::Applying);
        assert_eq!(plan.error.unwrap().code, "PLAN_CANCELLED");
    }

    #[test]
    fn reject_plan_is_terminal() {
        let engine = engine(simple_request(false));
        engine.reject_plan().unwrap();
        assert_eq!(engine.plan().status, PlanStatus::Rejected);
        assert!(matches!(
            engine.approve_plan(),
            Err(EngineError::Plan(PlanError::InvalidTransition { .. }))
        ));
    }
}
