// store.rs — BackingStore: the file-apply collaborator.
//
// The engine never touches the filesystem itself. Applying a change,
// taking a backup, and restoring from one are delegated to a
// BackingStore implementation; per-change atomicity is that
// implementation's responsibility.
//
// MemoryStore is the reference implementation: an in-memory path→content
// map with snapshot-token backups. It is what the integration tests run
// against, and the model for real adapters (git worktree, staged copy).

use std::collections::HashMap;

use thiserror::Error;

use devos_diff::DiffLineKind;
use devos_plan::{FileChange, FileOperation};

/// A failure reported by the backing store. The engine captures these
/// into file-change state rather than propagating them to callers.
#[derive(Debug, Error)]
#[error("backing store failure on {path}: {message}")]
pub struct StoreError {
    pub path: String,
    pub message: String,
}

impl StoreError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// External collaborator that owns real file state.
pub trait BackingStore {
    /// Apply one file change. Must be atomic per change.
    fn apply(&mut self, change: &FileChange) -> Result<(), StoreError>;

    /// Snapshot the state the change is about to mutate and return an
    /// opaque token that `restore` accepts later.
    fn backup(&mut self, change: &FileChange) -> Result<String, StoreError>;

    /// Restore the state captured under `backup_ref`.
    fn restore(&mut self, backup_ref: &str) -> Result<(), StoreError>;
}

/// In-memory backing store: path → content.
///
/// Content for created/modified files is materialized from the diff's
/// added and context lines — enough fidelity for tests and previews.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: HashMap<String, String>,
    /// backup token → (path, content at backup time; None = absent).
    backups: HashMap<String, (String, Option<String>)>,
    next_backup: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, bypassing the change pipeline (test setup).
    pub fn seed(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }

    /// Current content of a path, if present.
    pub fn content(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn new_side_content(change: &FileChange) -> String {
        let mut lines = Vec::new();
        for chunk in &change.diff {
            for line in &chunk.lines {
                match line.kind {
                    DiffLineKind::Context | DiffLineKind::Added => lines.push(line.content.clone()),
                    DiffLineKind::Removed => {}
                }
            }
        }
        lines.join("\n")
    }
}

impl BackingStore for MemoryStore {
    fn apply(&mut self, change: &FileChange) -> Result<(), StoreError> {
        let path = change.file_path.clone();
        match change.operation {
            FileOperation::Create => {
                if self.files.contains_key(&path) {
                    return Err(StoreError::new(&path, "file already exists"));
                }
                self.files.insert(path, Self::new_side_content(change));
            }
            FileOperation::Modify => {
                if !self.files.contains_key(&path) {
                    return Err(StoreError::new(&path, "file not found"));
                }
                self.files.insert(path, Self::new_side_content(change));
            }
            FileOperation::Delete => {
                if self.files.remove(&path).is_none() {
                    return Err(StoreError::new(&path, "file not found"));
                }
            }
            FileOperation::Rename | FileOperation::Move => {
                let target = change
                    .new_path
                    .clone()
                    .ok_or_else(|| StoreError::new(&path, "missing target path"))?;
                let content = self
                    .files
                    .remove(&path)
                    .ok_or_else(|| StoreError::new(&path, "file not found"))?;
                self.files.insert(target, content);
            }
            FileOperation::Copy => {
                let target = change
                    .new_path
                    .clone()
                    .unwrap_or_else(|| format!("{path}.copy"));
                let content = self
                    .files
                    .get(&path)
                    .cloned()
                    .ok_or_else(|| StoreError::new(&path, "file not found"))?;
                self.files.insert(target, content);
            }
        }
        tracing::debug!("MemoryStore: applied {:?} to {}", change.operation, change.file_path);
        Ok(())
    }

    fn backup(&mut self, change: &FileChange) -> Result<String, StoreError> {
        let path = change.file_path.clone();
        let token = format!("backup-{}", self.next_backup);
        self.next_backup += 1;
        let snapshot = self.files.get(&path).cloned();
        self.backups.insert(token.clone(), (path, snapshot));
        Ok(token)
    }

    fn restore(&mut self, backup_ref: &str) -> Result<(), StoreError> {
        let (path, snapshot) = self
            .backups
            .get(backup_ref)
            .cloned()
            .ok_or_else(|| StoreError::new(backup_ref, "unknown backup reference"))?;
        match snapshot {
            Some(content) => {
                self.files.insert(path, content);
            }
            None => {
                self.files.remove(&path);
            }
        }
        Ok(())
    }
}

/// A store that fails every apply — for exercising failure paths.
#[derive(Debug, Default)]
pub struct FailingStore;

impl BackingStore for FailingStore {
    fn apply(&mut self, change: &FileChange) -> Result<(), StoreError> {
        Err(StoreError::new(&change.file_path, "simulated apply failure"))
    }

    fn backup(&mut self, change: &FileChange) -> Result<String, StoreError> {
        Ok(format!("backup-{}", change.id))
    }

    fn restore(&mut self, _backup_ref: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devos_diff::{DiffChunk, DiffLine};

    fn create_change(path: &str, lines: &[&str]) -> FileChange {
        let diff_lines = lines
            .iter()
            .enumerate()
            .map(|(i, l)| DiffLine::added(*l, i as u32 + 1))
            .collect();
        FileChange::new(
            FileOperation::Create,
            path,
            vec![DiffChunk::new("c1", 1, lines.len() as u32, diff_lines)],
            64,
            "rust",
        )
        .unwrap()
    }

    #[test]
    fn create_materializes_added_lines() {
        let mut store = MemoryStore::new();
        let change = create_change("src/new.rs", &["fn main() {}", ""]);
        store.apply(&change).unwrap();
        assert_eq!(store.content("src/new.rs"), Some("fn main() {}\n"));
    }

    #[test]
    fn create_fails_if_file_exists() {
        let mut store = MemoryStore::new();
        store.seed("src/new.rs", "existing");
        let change = create_change("src/new.rs", &["fn main() {}"]);
        assert!(store.apply(&change).is_err());
    }

    #[test]
    fn modify_requires_existing_file() {
        let mut store = MemoryStore::new();
        let change = FileChange::new(FileOperation::Modify, "missing.rs", Vec::new(), 0, "rust")
            .unwrap();
        assert!(store.apply(&change).is_err());
    }

    #[test]
    fn delete_removes_file() {
        let mut store = MemoryStore::new();
        store.seed("old.rs", "content");
        let change =
            FileChange::new(FileOperation::Delete, "old.rs", Vec::new(), 0, "rust").unwrap();
        store.apply(&change).unwrap();
        assert!(!store.contains("old.rs"));
    }

    #[test]
    fn rename_moves_content() {
        let mut store = MemoryStore::new();
        store.seed("a.rs", "content");
        let change = FileChange::new(FileOperation::Rename, "a.rs", Vec::new(), 0, "rust")
            .unwrap()
            .with_new_path("b.rs")
            .unwrap();
        store.apply(&change).unwrap();
        assert!(!store.contains("a.rs"));
        assert_eq!(store.content("b.rs"), Some("content"));
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let mut store = MemoryStore::new();
        store.seed("src/lib.rs", "original");
        let change =
            FileChange::new(FileOperation::Delete, "src/lib.rs", Vec::new(), 0, "rust").unwrap();

        let token = store.backup(&change).unwrap();
        store.apply(&change).unwrap();
        assert!(!store.contains("src/lib.rs"));

        store.restore(&token).unwrap();
        assert_eq!(store.content("src/lib.rs"), Some("original"));
    }

    #[test]
    fn restore_of_absent_snapshot_removes_file() {
        // Backing up a not-yet-existing path records absence; restoring
        // that backup removes whatever was created since.
        let mut store = MemoryStore::new();
        let change = create_change("src/new.rs", &["fn main() {}"]);
        let token = store.backup(&change).unwrap();
        store.apply(&change).unwrap();
        store.restore(&token).unwrap();
        assert!(!store.contains("src/new.rs"));
    }

    #[test]
    fn restore_with_unknown_token_fails() {
        let mut store = MemoryStore::new();
        assert!(store.restore("backup-999").is_err());
    }
}
