//! Intermediate document model.
//!
//! - [`document`] - Epics, stories and exhaustive validation
//! - [`matching`] - Title matching policy
//! - [`file`] - Document file I/O (atomic write-back)

pub mod document;
pub mod file;
pub mod matching;

pub use document::{Document, Epic, Story, ValidationError, ValidationErrors};
pub use file::{atomic_write, read_document};
pub use matching::MatchPolicy;
