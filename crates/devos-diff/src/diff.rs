// diff.rs — Diff lines, chunks, and derived line counts.
//
// A diff here is an ordered sequence of chunks; each chunk covers a
// contiguous 1-based line range of the source file and carries the
// interleaved context/added/removed lines of the computed edit script.
// The interleaving is whatever the upstream differ produced — this crate
// stores and summarizes it, it does not compute diffs.

use serde::{Deserialize, Serialize};

/// What a single diff line represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffLineKind {
    /// Unchanged line, present on both sides.
    Context,
    /// Line present only on the new side.
    Added,
    /// Line present only on the old side.
    Removed,
}

/// One line of a diff hunk.
///
/// Line numbers are 1-based and side-specific: an added line has no
/// `old_line_no`, a removed line has no `new_line_no`, a context line
/// has both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_line_no: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_line_no: Option<u32>,
}

impl DiffLine {
    /// A context line, numbered on both sides.
    pub fn context(content: impl Into<String>, old_line_no: u32, new_line_no: u32) -> Self {
        Self {
            kind: DiffLineKind::Context,
            content: content.into(),
            old_line_no: Some(old_line_no),
            new_line_no: Some(new_line_no),
        }
    }

    /// An added line, numbered on the new side only.
    pub fn added(content: impl Into<String>, new_line_no: u32) -> Self {
        Self {
            kind: DiffLineKind::Added,
            content: content.into(),
            old_line_no: None,
            new_line_no: Some(new_line_no),
        }
    }

    /// A removed line, numbered on the old side only.
    pub fn removed(content: impl Into<String>, old_line_no: u32) -> Self {
        Self {
            kind: DiffLineKind::Removed,
            content: content.into(),
            old_line_no: Some(old_line_no),
            new_line_no: None,
        }
    }
}

/// One contiguous hunk of a file diff.
///
/// `start_line`/`end_line` are 1-based bounds in the source file. Lines
/// preserve source order; the chunk is immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffChunk {
    /// Identifier assigned by the producer (stable across serialization).
    pub id: String,
    pub start_line: u32,
    pub end_line: u32,
    pub lines: Vec<DiffLine>,
}

impl DiffChunk {
    pub fn new(id: impl Into<String>, start_line: u32, end_line: u32, lines: Vec<DiffLine>) -> Self {
        Self {
            id: id.into(),
            start_line,
            end_line,
            lines,
        }
    }

    /// Count of added lines in this chunk.
    pub fn added_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.kind == DiffLineKind::Added)
            .count()
    }

    /// Count of removed lines in this chunk.
    pub fn removed_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.kind == DiffLineKind::Removed)
            .count()
    }

    /// Added/removed counts for this chunk.
    pub fn stats(&self) -> DiffStats {
        DiffStats {
            lines_added: self.added_count(),
            lines_removed: self.removed_count(),
        }
    }
}

/// Summed added/removed line counts, used for file-change metadata and
/// review summaries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffStats {
    pub lines_added: usize,
    pub lines_removed: usize,
}

impl DiffStats {
    /// Total stats across an ordered sequence of chunks.
    pub fn for_chunks(chunks: &[DiffChunk]) -> Self {
        chunks.iter().fold(Self::default(), |mut acc, chunk| {
            acc.lines_added += chunk.added_count();
            acc.lines_removed += chunk.removed_count();
            acc
        })
    }
}
