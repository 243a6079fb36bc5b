//! # devos-engine
//!
//! The execution engine that carries an [`ActionPlan`] from AI proposal
//! through review, application, and rollback.
//!
//! The engine owns all plan state transitions: collaborators approve or
//! reject file changes, approve the plan, execute it against a
//! [`BackingStore`], and roll it back from backups. Every transition is
//! recorded in a bounded, hash-chained audit journal.
//!
//! ## Quick Example
//!
//! ```rust
//! use devos_engine::{ExecutionEngine, MemoryStore, PlanRequest, StaticValidator};
//!
//! let request: PlanRequest = serde_json::from_str(r#"{
//!     "title": "Add error handling",
//!     "description": "Wrap parser calls in Result",
//!     "steps": [
//!         {"id": "s1", "kind": "file_operation", "title": "Create module",
//!          "description": "",
//!          "file_changes": [{"operation": "create", "file_path": "src/errors.rs"}]}
//!     ]
//! }"#).unwrap();
//!
//! let engine = ExecutionEngine::new(
//!     "project-1", request, MemoryStore::new(), StaticValidator::new(),
//! ).unwrap();
//! engine.approve_plan().unwrap();
//! engine.execute_plan().unwrap();
//! assert!(engine.summary().completed_steps == 1);
//! ```

pub mod engine;
pub mod error;
pub mod request;
pub mod store;
pub mod validator;

pub use engine::ExecutionEngine;
pub use error::EngineError;
pub use request::{FileChangeRequest, PlanRequest, StepRequest};
pub use store::{BackingStore, FailingStore, MemoryStore, StoreError};
pub use validator::{
    PreconditionValidator, StaticValidator, UnavailableValidator, ValidationReport, ValidatorError,
};

// Re-exported so hosts can depend on devos-engine alone.
pub use devos_audit::{AuditAction, AuditEntry, AuditStatus};
pub use devos_plan::{ActionPlan, ExecutionStatus, PlanStatus, PlanSummary};
