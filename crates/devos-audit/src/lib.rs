//! # devos-audit
//!
//! Bounded append-only audit journal for the DevOS action-plan engine.
//!
//! Every state transition the engine performs is recorded as an
//! [`AuditEntry`] in an [`AuditJournal`]. The journal keeps the most
//! recent 1000 entries (FIFO eviction), hands out newest-first snapshot
//! copies to observers, and chains entries with SHA-256 hashes so
//! tampering inside the retained window is detectable.
//!
//! ## Quick Example
//!
//! ```rust
//! use devos_audit::{AuditAction, AuditEntry, AuditJournal, AuditStatus};
//!
//! let mut journal = AuditJournal::new();
//! let entry = AuditEntry::new(
//!     AuditAction::PlanCreated,
//!     AuditStatus::Success,
//!     "project-1",
//!     "Plan created: Refactor Button Component",
//! );
//! journal.append(entry).unwrap();
//! assert_eq!(journal.snapshot().len(), 1);
//! ```

pub mod entry;
pub mod error;
pub mod journal;

pub use entry::{AuditAction, AuditEntry, AuditErrorInfo, AuditStatus};
pub use error::AuditError;
pub use journal::{AuditJournal, DEFAULT_CAPACITY};
