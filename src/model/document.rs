//! Intermediate document: epics and stories between generation and push.
//!
//! The on-disk format is the JSON the generator writes, with stories nested
//! under their epic:
//!
//! ```json
//! {"epics": [{"key": "billing", "short_description": "Billing portal",
//!             "description": "...", "priority": "high",
//!             "stories": [{"gap_id": "B-1", "short_description": "Pay invoices online",
//!                          "acceptance_criteria": ["..."], "priority": "critical"}]}]}
//! ```
//!
//! Stories may also be listed in a top-level `stories` array with an explicit
//! `parent_epic_title`. Either way the parsed [`Document`] holds epics and
//! stories as two flat collections linked by parent title.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::schema::{RecordType, Schema};
use crate::validate::find_similar;

use super::file::{atomic_write, read_document};
use super::matching::MatchPolicy;

/// Top-level grouping record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Epic {
    pub title: String,
    pub description: String,
    pub priority: Option<String>,
    /// Generator-assigned identifier (snake_case).
    pub key: Option<String>,
    /// Remote id, backfilled after a successful create.
    pub remote_id: Option<String>,
}

/// Leaf record owned by exactly one epic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: Option<String>,
    /// Reference id from the source document, if it had one.
    pub gap_id: Option<String>,
    pub remote_id: Option<String>,
    /// Title of the owning epic. Resolved to its remote id at write time.
    pub parent_epic_title: String,
}

/// A single document defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("{record_type} #{position} has an empty title")]
    EmptyTitle {
        record_type: RecordType,
        position: usize,
    },

    #[error("Duplicate {record_type} title '{title}' ({count} occurrences)")]
    DuplicateTitle {
        record_type: RecordType,
        title: String,
        count: usize,
    },

    #[error("Story '{story}' has no parent epic")]
    MissingParent { story: String },

    #[error("Story '{story}' references unknown epic '{parent}'{}", suggest(.similar))]
    DanglingParent {
        story: String,
        parent: String,
        similar: Vec<String>,
    },

    #[error("Story '{story}' is nested under '{container}' but names parent '{parent}'")]
    ConflictingParent {
        story: String,
        container: String,
        parent: String,
    },

    #[error("{record_type} '{title}' sets both '{key}' ('{value}') and '{alias}' ('{alias_value}'); keep one")]
    ConflictingKeys {
        record_type: RecordType,
        title: String,
        key: &'static str,
        alias: &'static str,
        value: String,
        alias_value: String,
    },

    #[error("Unknown priority '{key}' on {record_type} '{title}'{}", suggest(.similar))]
    UnknownPriority {
        record_type: RecordType,
        title: String,
        key: String,
        similar: Vec<String>,
    },
}

fn suggest(similar: &[String]) -> String {
    if similar.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", similar.join(", "))
    }
}

/// Every defect found in a document, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ── Wire format ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawDocument {
    #[serde(default)]
    epics: Vec<RawEpic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stories: Vec<RawStory>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawEpic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, skip_serializing)]
    short_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_id: Option<String>,
    #[serde(default, skip_serializing)]
    sys_id: Option<String>,
    #[serde(default)]
    stories: Vec<RawStory>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawStory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gap_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, skip_serializing)]
    short_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_id: Option<String>,
    #[serde(default, skip_serializing)]
    sys_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_epic_title: Option<String>,
}

/// Pick a value that may arrive under its own key or a remote-style alias
/// (`short_description`, `sys_id`). Both keys with different values is a
/// defect naming the record.
fn merge_alias(
    record_type: RecordType,
    title: Option<&str>,
    (key, alias): (&'static str, &'static str),
    value: Option<String>,
    alias_value: Option<String>,
    errors: &mut Vec<ValidationError>,
) -> Option<String> {
    match (value, alias_value) {
        (Some(value), Some(alias_value)) if value != alias_value => {
            let title = title.unwrap_or(value.as_str()).to_string();
            errors.push(ValidationError::ConflictingKeys {
                record_type,
                title,
                key,
                alias,
                value: value.clone(),
                alias_value,
            });
            Some(value)
        }
        (value, alias_value) => value.or(alias_value),
    }
}

impl RawEpic {
    fn title(&mut self, errors: &mut Vec<ValidationError>) -> String {
        merge_alias(
            RecordType::Epic,
            None,
            ("title", "short_description"),
            self.title.take(),
            self.short_description.take(),
            errors,
        )
        .unwrap_or_default()
    }
}

impl RawStory {
    fn title(&mut self, errors: &mut Vec<ValidationError>) -> String {
        merge_alias(
            RecordType::Story,
            None,
            ("title", "short_description"),
            self.title.take(),
            self.short_description.take(),
            errors,
        )
        .unwrap_or_default()
    }

    fn into_story(mut self, parent_epic_title: String, errors: &mut Vec<ValidationError>) -> Story {
        let title = self.title(errors);
        let remote_id = merge_alias(
            RecordType::Story,
            Some(&title),
            ("remote_id", "sys_id"),
            self.remote_id,
            self.sys_id,
            errors,
        );
        Story {
            title,
            description: self.description.unwrap_or_default(),
            acceptance_criteria: self.acceptance_criteria,
            priority: self.priority,
            gap_id: self.gap_id,
            remote_id,
            parent_epic_title,
        }
    }

    fn nested(story: &Story) -> Self {
        Self {
            gap_id: story.gap_id.clone(),
            title: Some(story.title.clone()),
            short_description: None,
            description: Some(story.description.clone()),
            acceptance_criteria: story.acceptance_criteria.clone(),
            priority: story.priority.clone(),
            remote_id: story.remote_id.clone(),
            sys_id: None,
            parent_epic_title: None,
        }
    }
}

// ── Document ─────────────────────────────────────────────────

/// Validated two-level backlog tree.
#[derive(Debug, Clone)]
pub struct Document {
    epics: Vec<Epic>,
    stories: Vec<Story>,
    policy: MatchPolicy,
    warnings: Vec<String>,
}

impl Document {
    /// Parse and validate a JSON document.
    ///
    /// Validation is exhaustive: every defect is collected before returning.
    ///
    /// # Errors
    ///
    /// Returns all `ValidationError`s found, or a single `Malformed` error if
    /// the JSON itself cannot be parsed.
    pub fn parse(
        raw: &str,
        schema: &Schema,
        policy: MatchPolicy,
    ) -> std::result::Result<Self, ValidationErrors> {
        let doc: RawDocument = serde_json::from_str(raw)
            .map_err(|e| ValidationErrors(vec![ValidationError::Malformed(e.to_string())]))?;

        let mut errors = Vec::new();
        let mut epics = Vec::with_capacity(doc.epics.len());
        let mut stories = Vec::new();

        for mut raw_epic in doc.epics {
            let title = raw_epic.title(&mut errors);
            let remote_id = merge_alias(
                RecordType::Epic,
                Some(&title),
                ("remote_id", "sys_id"),
                raw_epic.remote_id,
                raw_epic.sys_id,
                &mut errors,
            );
            for raw_story in raw_epic.stories {
                let named_parent = raw_story.parent_epic_title.clone();
                let story = raw_story.into_story(title.clone(), &mut errors);
                if let Some(parent) = named_parent {
                    if !policy.matches(&parent, &title) {
                        errors.push(ValidationError::ConflictingParent {
                            story: story.title.clone(),
                            container: title.clone(),
                            parent,
                        });
                    }
                }
                stories.push(story);
            }
            epics.push(Epic {
                title,
                description: raw_epic.description.unwrap_or_default(),
                priority: raw_epic.priority,
                key: raw_epic.key,
                remote_id,
            });
        }

        for raw_story in doc.stories {
            let parent = raw_story.parent_epic_title.clone().unwrap_or_default();
            stories.push(raw_story.into_story(parent, &mut errors));
        }

        match Self::from_parts(epics, stories, schema, policy) {
            Ok(document) if errors.is_empty() => Ok(document),
            Ok(_) => Err(ValidationErrors(errors)),
            Err(ValidationErrors(rest)) => {
                errors.extend(rest);
                Err(ValidationErrors(errors))
            }
        }
    }

    /// Read, parse and validate a document file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// `Error::Validation` with every defect found.
    pub fn load(path: &Path, schema: &Schema, policy: MatchPolicy) -> Result<Self> {
        let raw = read_document(path)?;
        let document = Self::parse(&raw, schema, policy)?;
        tracing::debug!(
            path = %path.display(),
            epics = document.epics.len(),
            stories = document.stories.len(),
            "Loaded document"
        );
        Ok(document)
    }

    /// Build a document from already-separated collections.
    ///
    /// # Errors
    ///
    /// Returns every validation defect found.
    pub fn from_parts(
        epics: Vec<Epic>,
        stories: Vec<Story>,
        schema: &Schema,
        policy: MatchPolicy,
    ) -> std::result::Result<Self, ValidationErrors> {
        let mut errors = Vec::new();

        // 1. Non-empty titles
        for (i, epic) in epics.iter().enumerate() {
            if epic.title.trim().is_empty() {
                errors.push(ValidationError::EmptyTitle {
                    record_type: RecordType::Epic,
                    position: i + 1,
                });
            }
        }
        for (i, story) in stories.iter().enumerate() {
            if story.title.trim().is_empty() {
                errors.push(ValidationError::EmptyTitle {
                    record_type: RecordType::Story,
                    position: i + 1,
                });
            }
        }

        // 2. Unique titles per record type
        errors.extend(duplicates(
            RecordType::Epic,
            epics.iter().map(|e| e.title.as_str()),
            policy,
        ));
        errors.extend(duplicates(
            RecordType::Story,
            stories.iter().map(|s| s.title.as_str()),
            policy,
        ));

        // 3. Every parent resolves
        let epic_keys: HashSet<String> = epics
            .iter()
            .filter(|e| !e.title.trim().is_empty())
            .map(|e| policy.key(&e.title))
            .collect();
        for story in &stories {
            if story.parent_epic_title.trim().is_empty() {
                errors.push(ValidationError::MissingParent {
                    story: story.title.clone(),
                });
            } else if !epic_keys.contains(&policy.key(&story.parent_epic_title)) {
                errors.push(ValidationError::DanglingParent {
                    story: story.title.clone(),
                    parent: story.parent_epic_title.clone(),
                    similar: find_similar(
                        &story.parent_epic_title,
                        epics.iter().map(|e| e.title.as_str()),
                        3,
                    ),
                });
            }
        }

        // 4. Priorities exist in the schema
        let priorities = schema.priorities();
        let records = epics
            .iter()
            .map(|e| (RecordType::Epic, &e.title, &e.priority))
            .chain(
                stories
                    .iter()
                    .map(|s| (RecordType::Story, &s.title, &s.priority)),
            );
        for (record_type, title, priority) in records {
            if let Some(key) = priority {
                if !priorities.contains(key) {
                    errors.push(ValidationError::UnknownPriority {
                        record_type,
                        title: title.clone(),
                        key: key.clone(),
                        similar: find_similar(key, priorities.keys(), 3),
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(ValidationErrors(errors));
        }

        let warnings = epics
            .iter()
            .filter(|e| {
                let key = policy.key(&e.title);
                !stories
                    .iter()
                    .any(|s| policy.key(&s.parent_epic_title) == key)
            })
            .map(|e| format!("Epic '{}' has no stories", e.title))
            .collect();

        Ok(Self {
            epics,
            stories,
            policy,
            warnings,
        })
    }

    /// Epics in document order.
    #[must_use]
    pub fn epics(&self) -> &[Epic] {
        &self.epics
    }

    /// Stories in document order.
    #[must_use]
    pub fn stories(&self) -> &[Story] {
        &self.stories
    }

    #[must_use]
    pub const fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// Non-fatal observations (e.g. epics without stories).
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Total number of records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.epics.len() + self.stories.len()
    }

    /// Index of the epic a title resolves to.
    #[must_use]
    pub fn epic_index(&self, title: &str) -> Option<usize> {
        let key = self.policy.key(title);
        self.epics
            .iter()
            .position(|e| self.policy.key(&e.title) == key)
    }

    /// The epic owning a story.
    #[must_use]
    pub fn parent_of(&self, story: &Story) -> Option<&Epic> {
        self.epic_index(&story.parent_epic_title)
            .and_then(|i| self.epics.get(i))
    }

    /// Stories owned by an epic, in document order.
    pub fn stories_of<'a>(&'a self, epic: &'a Epic) -> impl Iterator<Item = &'a Story> + 'a {
        let key = self.policy.key(&epic.title);
        self.stories
            .iter()
            .filter(move |s| self.policy.key(&s.parent_epic_title) == key)
    }

    pub(crate) fn set_remote_id(&mut self, record_type: RecordType, index: usize, id: Option<String>) {
        let slot = match record_type {
            RecordType::Epic => self.epics.get_mut(index).map(|e| &mut e.remote_id),
            RecordType::Story => self.stories.get_mut(index).map(|s| &mut s.remote_id),
        };
        if let Some(slot) = slot {
            *slot = id;
        }
    }

    /// Serialize back to the nested on-disk format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        let raw = RawDocument {
            epics: self
                .epics
                .iter()
                .map(|epic| RawEpic {
                    key: epic.key.clone(),
                    title: Some(epic.title.clone()),
                    short_description: None,
                    description: Some(epic.description.clone()),
                    priority: epic.priority.clone(),
                    remote_id: epic.remote_id.clone(),
                    sys_id: None,
                    stories: self
                        .stories_of(epic)
                        .map(RawStory::nested)
                        .collect(),
                })
                .collect(),
            stories: Vec::new(),
        };
        serde_json::to_string_pretty(&raw)
    }

    /// Atomically write the document (with any backfilled ids) to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut content = self.to_json_pretty()?;
        content.push('\n');
        atomic_write(path, &content)
    }
}

fn duplicates<'a>(
    record_type: RecordType,
    titles: impl Iterator<Item = &'a str>,
    policy: MatchPolicy,
) -> Vec<ValidationError> {
    let mut counts: Vec<(String, &str, usize)> = Vec::new();
    for title in titles.filter(|t| !t.trim().is_empty()) {
        let key = policy.key(title);
        match counts.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, _, count)) => *count += 1,
            None => counts.push((key, title, 1)),
        }
    }

    counts
        .into_iter()
        .filter(|(_, _, count)| *count > 1)
        .map(|(_, title, count)| ValidationError::DuplicateTitle {
            record_type,
            title: title.to_string(),
            count,
        })
        .collect()
}
