// journal.rs — Bounded append-only audit journal.
//
// The journal keeps at most `capacity` entries (default 1000) in memory,
// evicting the oldest first — a FIFO bound, not time-based. Appends link
// each entry to its predecessor via a SHA-256 hash of the predecessor's
// serialized form, so tampering inside the retained window is detectable.
// Eviction drops the chain's head, which is why verification skips the
// oldest retained entry's link.
//
// Reads are copy-on-read: `snapshot()` clones the retained entries
// (newest first), so observers never see a half-appended journal.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::entry::AuditEntry;
use crate::error::AuditError;

/// Default retention bound: the most recent 1000 entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// An in-memory, bounded, append-only audit journal.
#[derive(Debug)]
pub struct AuditJournal {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
    /// Hash of the last appended entry, for chaining the next one.
    last_hash: Option<String>,
}

impl AuditJournal {
    /// Create a journal with the default 1000-entry bound.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a journal retaining at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
            last_hash: None,
        }
    }

    /// Append an entry, linking it to the previous one and evicting the
    /// oldest entry if the bound is exceeded.
    pub fn append(&mut self, mut entry: AuditEntry) -> Result<(), AuditError> {
        entry.previous_hash = self.last_hash.clone();
        self.last_hash = Some(hash_entry(&entry)?);
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
            tracing::trace!("audit journal at capacity, evicted oldest entry");
        }
        Ok(())
    }

    /// Cloned view of the retained entries, newest first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Verify the hash chain over the retained window.
    ///
    /// Each entry's `previous_hash` must match the hash of the entry
    /// before it. The oldest retained entry's link may point at an
    /// evicted entry and is not checked.
    pub fn verify_chain(&self) -> Result<(), AuditError> {
        let mut previous_hash: Option<String> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 && entry.previous_hash != previous_hash {
                return Err(AuditError::IntegrityViolation {
                    index,
                    expected: previous_hash.unwrap_or_else(|| "none".to_string()),
                    actual: entry
                        .previous_hash
                        .clone()
                        .unwrap_or_else(|| "none".to_string()),
                });
            }
            previous_hash = Some(hash_entry(entry)?);
        }
        Ok(())
    }
}

impl Default for AuditJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 over an entry's serialized form.
fn hash_entry(entry: &AuditEntry) -> Result<String, AuditError> {
    let json = serde_json::to_string(entry)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
