//! Priority translation table.
//!
//! Maps the document's priority keys (`critical`, `high`, ...) to the numeric
//! codes the remote store expects, and back. Codes are unique so the reverse
//! direction is always well-defined.

use serde::Serialize;

use super::SchemaError;

/// One row of the priority table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriorityEntry {
    /// Key used in the intermediate document.
    pub key: String,
    /// Numeric code written to the remote store.
    pub code: i64,
    /// Display label (e.g. "1 - Critical").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Guidance for the upstream generator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

/// Ordered key → code table with reverse lookup.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct PriorityTable {
    entries: Vec<PriorityEntry>,
}

impl PriorityTable {
    /// Build a table, rejecting empty tables, empty keys, duplicate keys and
    /// duplicate codes.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::MalformedPriorities` describing the first defect.
    pub fn new(entries: Vec<PriorityEntry>) -> Result<Self, SchemaError> {
        if entries.is_empty() {
            return Err(SchemaError::MalformedPriorities(
                "priority table is empty".to_string(),
            ));
        }

        for (i, entry) in entries.iter().enumerate() {
            if entry.key.trim().is_empty() {
                return Err(SchemaError::MalformedPriorities(
                    "priority key must not be empty".to_string(),
                ));
            }
            if let Some(dup) = entries[..i].iter().find(|e| e.key == entry.key) {
                return Err(SchemaError::MalformedPriorities(format!(
                    "duplicate priority key '{}'",
                    dup.key
                )));
            }
            if let Some(dup) = entries[..i].iter().find(|e| e.code == entry.code) {
                return Err(SchemaError::MalformedPriorities(format!(
                    "priorities '{}' and '{}' share code {}",
                    dup.key, entry.key, entry.code
                )));
            }
        }

        Ok(Self { entries })
    }

    /// Translate a key to its remote code.
    #[must_use]
    pub fn code(&self, key: &str) -> Option<i64> {
        self.get(key).map(|e| e.code)
    }

    /// Reverse lookup: the key that translates to `code`.
    #[must_use]
    pub fn key_for(&self, code: i64) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.code == code)
            .map(|e| e.key.as_str())
    }

    /// Full entry for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&PriorityEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Whether `key` is a declared priority.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Display label for a key, falling back to the key itself.
    #[must_use]
    pub fn label<'a>(&'a self, key: &'a str) -> &'a str {
        self.get(key)
            .and_then(|e| e.label.as_deref())
            .unwrap_or(key)
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Entries in declaration order.
    #[must_use]
    pub fn entries(&self) -> &[PriorityEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
