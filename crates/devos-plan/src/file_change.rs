// file_change.rs — FileChange: one file-level edit under review.
//
// A FileChange wraps one diff with its operation type, execution status,
// and derived metadata. Reviewer-facing transitions (approve, reject,
// retry) and engine-facing transitions (mark_running, mark_completed,
// mark_failed, mark_cancelled, the rollback stages) all funnel through
// the ExecutionStatus graph — an edge not in the graph is rejected and
// leaves the change untouched.
//
// Backup discipline: for every operation except `create`, a backup
// reference must be recorded before the change may complete. `create`
// is exempt — there is nothing to back up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use devos_diff::{DiffChunk, DiffStats};

use crate::error::PlanError;
use crate::status::ExecutionStatus;

/// What kind of file-level edit this is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Modify,
    Delete,
    Rename,
    Copy,
    Move,
}

impl FileOperation {
    /// Rename, copy, and move target a second path.
    pub fn requires_new_path(&self) -> bool {
        matches!(self, FileOperation::Rename | FileOperation::Move)
    }

    /// Every operation except create touches existing content and so
    /// needs a backup before it may complete.
    pub fn needs_backup(&self) -> bool {
        !matches!(self, FileOperation::Create)
    }
}

/// Derived size/shape information about a file change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeMetadata {
    pub size_bytes: u64,
    pub lines_added: usize,
    pub lines_removed: usize,
    /// Language or format hint (e.g., "rust", "json").
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// One file-level edit: operation + diff + execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub id: Uuid,
    pub operation: FileOperation,
    pub file_path: String,
    /// Target path — set iff the operation is rename or move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    pub status: ExecutionStatus,
    /// Ordered diff hunks for this file.
    pub diff: Vec<DiffChunk>,
    pub metadata: ChangeMetadata,
    /// Opaque token from the backing store, set when a backup is taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<String>,
    /// SHA-256 of the serialized diff, computed at construction.
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FileChange {
    /// Create a pending file change. Line counts are derived from the
    /// diff; the checksum is computed over the serialized diff content.
    pub fn new(
        operation: FileOperation,
        file_path: impl Into<String>,
        diff: Vec<DiffChunk>,
        size_bytes: u64,
        file_type: impl Into<String>,
    ) -> Result<Self, PlanError> {
        let file_path = file_path.into();
        if file_path.is_empty() {
            return Err(PlanError::InvalidArgument(
                "file change requires a non-empty path".to_string(),
            ));
        }
        let stats = DiffStats::for_chunks(&diff);
        let checksum = compute_checksum(&diff)?;
        Ok(Self {
            id: Uuid::new_v4(),
            operation,
            file_path,
            new_path: None,
            status: ExecutionStatus::Pending,
            diff,
            metadata: ChangeMetadata {
                size_bytes,
                lines_added: stats.lines_added,
                lines_removed: stats.lines_removed,
                file_type: file_type.into(),
                encoding: Some("utf-8".to_string()),
            },
            backup_ref: None,
            checksum,
            applied_at: None,
            rollback_at: None,
            error_message: None,
        })
    }

    /// Set the target path for a rename or move. Rejected for operations
    /// that do not take one.
    pub fn with_new_path(mut self, new_path: impl Into<String>) -> Result<Self, PlanError> {
        if !self.operation.requires_new_path() {
            return Err(PlanError::InvalidArgument(format!(
                "operation {:?} does not take a new path",
                self.operation
            )));
        }
        self.new_path = Some(new_path.into());
        Ok(self)
    }

    /// Verify the checksum still matches the diff content.
    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.diff)
            .map(|expected| expected == self.checksum)
            .unwrap_or(false)
    }

    /// Record reviewer approval.
    ///
    /// Approval is distinct from execution: it marks the change as
    /// reviewed-and-accepted without touching the backing store. A no-op
    /// if the change has already left pending (double-approval guard).
    pub fn approve(&mut self) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Completed;
        }
    }

    /// Record reviewer rejection. Valid only from pending.
    pub fn reject(&mut self) -> Result<(), PlanError> {
        if self.status != ExecutionStatus::Pending {
            return Err(PlanError::InvalidTransition {
                from: self.status.to_string(),
                to: ExecutionStatus::Failed.to_string(),
            });
        }
        self.status = ExecutionStatus::Failed;
        self.error_message = Some("rejected by reviewer".to_string());
        Ok(())
    }

    /// Reset a failed change to pending and clear its error. Valid only
    /// from failed.
    pub fn retry(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Pending)?;
        self.error_message = None;
        Ok(())
    }

    /// Record the backing store's backup token for this change.
    pub fn set_backup_ref(&mut self, backup_ref: impl Into<String>) {
        self.backup_ref = Some(backup_ref.into());
    }

    // Engine-facing transitions.

    pub fn mark_running(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Running)
    }

    /// Complete the change. Enforces the backup invariant: operations
    /// that touch existing content must have a backup ref first.
    pub fn mark_completed(&mut self) -> Result<(), PlanError> {
        if self.operation.needs_backup() && self.backup_ref.is_none() {
            return Err(PlanError::InvalidArgument(format!(
                "backup required before completion of {}",
                self.file_path
            )));
        }
        self.transition(ExecutionStatus::Completed)?;
        self.applied_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::Cancelled)
    }

    /// Begin rollback. Valid only from completed, and only when a backup
    /// reference exists.
    pub fn rollback_begin(&mut self) -> Result<(), PlanError> {
        if self.status == ExecutionStatus::Completed && self.backup_ref.is_none() {
            return Err(PlanError::RollbackUnavailable {
                file_change_id: self.id,
            });
        }
        self.transition(ExecutionStatus::RollbackPending)?;
        self.transition(ExecutionStatus::RollbackRunning)
    }

    /// Finish rollback after the backing store restored the backup.
    pub fn rollback_finish(&mut self) -> Result<(), PlanError> {
        self.transition(ExecutionStatus::RollbackCompleted)?;
        self.rollback_at = Some(Utc::now());
        Ok(())
    }

    /// Stamp when the engine applied a reviewer-completed change without
    /// re-walking the status machine (bulk-approval path).
    pub fn stamp_applied(&mut self) {
        self.applied_at = Some(Utc::now());
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

/// SHA-256 over the serialized diff chunks.
fn compute_checksum(diff: &[DiffChunk]) -> Result<String, PlanError> {
    let json = serde_json::to_string(diff)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
