//! Title matching policy.
//!
//! Titles are the only natural key shared between the local document and the
//! remote store. The policy decides when two titles are "the same record";
//! the default is a case-sensitive exact match.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How titles are compared for duplicate detection, parent resolution and
/// remote matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// Byte-for-byte equality.
    #[default]
    Exact,
    /// Equality after lowercasing.
    CaseInsensitive,
    /// Lowercased, trimmed, inner whitespace collapsed to single spaces.
    Normalized,
}

impl MatchPolicy {
    /// Canonical key for a title under this policy.
    #[must_use]
    pub fn key(&self, title: &str) -> String {
        match self {
            Self::Exact => title.to_string(),
            Self::CaseInsensitive => title.to_lowercase(),
            Self::Normalized => title
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase(),
        }
    }

    /// Whether two titles name the same record.
    #[must_use]
    pub fn matches(&self, a: &str, b: &str) -> bool {
        self.key(a) == self.key(b)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::CaseInsensitive => "case-insensitive",
            Self::Normalized => "normalized",
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "case-insensitive" | "case_insensitive" | "ci" => Ok(Self::CaseInsensitive),
            "normalized" | "normalised" => Ok(Self::Normalized),
            _ => Err(format!(
                "unknown match policy '{s}' (exact, case-insensitive, normalized)"
            )),
        }
    }
}
