//! Run modes, per-record outcomes and the run result.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::remote::RemoteError;
use crate::schema::RecordType;

/// What the reconciler is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Compute the plan without any remote write.
    ///
    /// `updates` previews the updates `CreateAndUpdate` would make;
    /// otherwise existing records are reported as skipped.
    DryRun { updates: bool },
    /// Create new records, leave existing ones alone.
    #[default]
    CreateOnly,
    /// Create new records and update matched ones.
    CreateAndUpdate,
}

impl RunMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun { .. } => "dry_run",
            Self::CreateOnly => "create_only",
            Self::CreateAndUpdate => "create_and_update",
        }
    }

    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun { .. })
    }

    /// Whether matched records get an update (or a planned one).
    #[must_use]
    pub const fn touches_existing(&self) -> bool {
        matches!(self, Self::CreateAndUpdate | Self::DryRun { updates: true })
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for RunMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    Updated,
    Skipped,
    Failed,
    PlannedCreate,
    PlannedUpdate,
}

impl Action {
    pub const ALL: [Self; 6] = [
        Self::Created,
        Self::Updated,
        Self::Skipped,
        Self::Failed,
        Self::PlannedCreate,
        Self::PlannedUpdate,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::PlannedCreate => "planned_create",
            Self::PlannedUpdate => "planned_update",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action: {s}"))
    }
}

/// Why a record was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Matched an existing remote record and the mode does not update.
    AlreadyExists,
    /// The owning epic failed to be created.
    ParentFailed,
    /// A fatal error stopped the run before this record was written.
    RunAborted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => f.write_str("already exists"),
            Self::ParentFailed => f.write_str("parent failed"),
            Self::RunAborted => f.write_str("run aborted"),
        }
    }
}

/// A story's parent has no remote id although it did not fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Consistency error: parent epic '{parent}' of story '{story}' has no remote id")]
pub struct ConsistencyError {
    pub story: String,
    pub parent: String,
}

/// Result for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub record_type: RecordType,
    pub title: String,
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Owning epic, for stories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    #[must_use]
    pub fn new(record_type: RecordType, title: impl Into<String>, action: Action) -> Self {
        Self {
            record_type,
            title: title.into(),
            action,
            remote_id: None,
            parent_title: None,
            reason: None,
            error: None,
        }
    }

    #[must_use]
    pub fn skipped(record_type: RecordType, title: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::new(record_type, title, Action::Skipped)
        }
    }

    #[must_use]
    pub fn failed(record_type: RecordType, title: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(record_type, title, Action::Failed)
        }
    }

    #[must_use]
    pub fn with_remote_id(mut self, remote_id: Option<String>) -> Self {
        self.remote_id = remote_id;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_title: Option<String>) -> Self {
        self.parent_title = parent_title;
        self
    }
}

/// Ordered outcomes of one reconciliation run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<Outcome>,
    /// Fatal error that stopped the run early. Records not written after it
    /// are skipped with [`SkipReason::RunAborted`].
    #[serde(skip)]
    pub aborted: Option<RemoteError>,
}

impl RunResult {
    /// Outcomes with a given action.
    pub fn with_action(&self, action: Action) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(move |o| o.action == action)
    }

    /// Outcome for a record, if one was recorded.
    #[must_use]
    pub fn outcome(&self, record_type: RecordType, title: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.record_type == record_type && o.title == title)
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.aborted.is_some() || self.outcomes.iter().any(|o| o.action == Action::Failed)
    }
}
