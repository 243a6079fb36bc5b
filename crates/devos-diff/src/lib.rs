//! # devos-diff
//!
//! The hunk-based diff data model for the DevOS action-plan engine.
//!
//! A [`DiffChunk`] is one contiguous hunk of a file's proposed change,
//! made of ordered [`DiffLine`]s (context / added / removed). Chunks are
//! immutable once constructed — the diffing collaborator upstream produces
//! the full chunk/line sequence in one shot, and everything downstream
//! (file-change metadata, review UIs) only reads it.

pub mod diff;

pub use diff::{DiffChunk, DiffLine, DiffLineKind, DiffStats};
