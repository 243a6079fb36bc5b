// entry.rs — Audit entry data model.
//
// Every state transition the engine performs — plan created, step
// started, file applied, rollback finished — is recorded as one
// AuditEntry. Entries are immutable after append; the journal links
// them with a previous_hash chain for tamper detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of transition or event this entry records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// The AI collaborator returned a response.
    AiResponse,
    /// A plan finished population and became pending.
    PlanCreated,
    /// A reviewer approved the plan.
    PlanApproved,
    /// A reviewer rejected the plan.
    PlanRejected,
    /// The plan finished executing.
    PlanExecuted,
    /// The plan was rolled back.
    PlanRolledBack,
    /// A step began executing.
    StepStarted,
    /// A step completed.
    StepCompleted,
    /// A step failed.
    StepFailed,
    /// A step was skipped because an upstream dependency failed, or
    /// cancelled cooperatively.
    StepCancelled,
    /// A reviewer approved one file change.
    FileApproved,
    /// A reviewer rejected one file change.
    FileRejected,
    /// One file change was applied via the backing store.
    FileApplied,
    /// One file change was restored from backup.
    FileRollback,
    /// A backup was taken before a mutating operation.
    BackupCreated,
    /// A project file was (re)indexed.
    FileIndexed,
    /// An error occurred during processing.
    Error,
}

/// Outcome recorded on an entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failed,
    RolledBack,
    Pending,
    Running,
}

/// Machine-readable error payload attached to failure entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// One immutable record of an engine state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub status: AuditStatus,
    /// Which project the plan belongs to.
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_affected: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_change_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuditErrorInfo>,
    /// Additional structured context, keyed per action kind.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Hash of the previous retained entry; None on the journal's first
    /// entry. Set by the journal at append time, never by callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
}

impl AuditEntry {
    /// Create a new entry with the current timestamp and a random id.
    pub fn new(
        action: AuditAction,
        status: AuditStatus,
        project_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            description: description.into(),
            timestamp: Utc::now(),
            status,
            project_id: project_id.into(),
            files_affected: None,
            step_id: None,
            file_change_id: None,
            error: None,
            metadata: serde_json::Value::Null,
            duration_ms: None,
            previous_hash: None,
        }
    }

    /// Set the affected file paths and return self (builder pattern).
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files_affected = Some(files);
        self
    }

    pub fn with_step(mut self, step_id: Uuid) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_file_change(mut self, file_change_id: Uuid) -> Self {
        self.file_change_id = Some(file_change_id);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(AuditErrorInfo {
            code: code.into(),
            message: message.into(),
            stack: None,
        });
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}
