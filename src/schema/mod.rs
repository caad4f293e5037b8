//! Schema registry.
//!
//! A schema is a declarative YAML file describing where epics and stories
//! live on the remote side and how local attributes map onto remote fields:
//!
//! ```yaml
//! tables:
//!   epic:
//!     table: rm_epic
//!     fields: { title: short_description, description: description, priority: priority }
//!   story:
//!     table: rm_story
//!     parent_field: epic
//!     acceptance_criteria_format: bullets
//!     fields: { title: short_description, acceptance_criteria: acceptance_criteria }
//!     static_fields: { state: "-6" }
//! priorities:
//!   critical: { value: 1, label: "1 - Critical" }
//!   low: 4
//! default_priority: low
//! ```
//!
//! Everything is checked once at load time so the reconciler never has to
//! resolve a mapping ad hoc. Unknown top-level sections (e.g. generator
//! instructions) are ignored.

mod priority;

pub use priority::{PriorityEntry, PriorityTable};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::{Mapping, Value};

/// YAML source of the builtin ServiceNow mapping.
pub const BUILTIN_SCHEMA: &str = include_str!("builtin.yaml");

/// Errors raised while loading a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Failed to read schema file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse schema: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing required schema section: {0}")]
    MissingSection(String),

    #[error("Malformed schema section {section}: {message}")]
    Malformed { section: String, message: String },

    #[error("Unknown record type '{0}' in tables (expected epic or story)")]
    UnknownRecordType(String),

    #[error("Invalid table identifier '{table}' for {record_type}")]
    InvalidTable { record_type: String, table: String },

    #[error("Unknown attribute '{attribute}' in {record_type} field mapping")]
    UnknownAttribute {
        record_type: String,
        attribute: String,
    },

    #[error("Malformed priority table: {0}")]
    MalformedPriorities(String),
}

/// The two record types of the backlog hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Epic,
    Story,
}

impl RecordType {
    /// Parents first.
    pub const ALL: [Self; 2] = [Self::Epic, Self::Story];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Story => "story",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "epic" => Some(Self::Epic),
            "story" => Some(Self::Story),
            _ => None,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local attributes a field mapping may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalAttribute {
    Title,
    Description,
    Priority,
    AcceptanceCriteria,
    /// Generator-assigned epic identifier.
    Key,
    /// Reference id carried over from the source document.
    GapId,
}

impl LocalAttribute {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Priority => "priority",
            Self::AcceptanceCriteria => "acceptance_criteria",
            Self::Key => "key",
            Self::GapId => "gap_id",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "title" => Some(Self::Title),
            "description" => Some(Self::Description),
            "priority" => Some(Self::Priority),
            "acceptance_criteria" => Some(Self::AcceptanceCriteria),
            "key" => Some(Self::Key),
            "gap_id" => Some(Self::GapId),
            _ => None,
        }
    }

    /// Whether records of `record_type` carry this attribute.
    #[must_use]
    pub const fn applies_to(&self, record_type: RecordType) -> bool {
        match self {
            Self::Title | Self::Description | Self::Priority => true,
            Self::Key => matches!(record_type, RecordType::Epic),
            Self::AcceptanceCriteria | Self::GapId => matches!(record_type, RecordType::Story),
        }
    }
}

/// How a story's acceptance criteria are joined into one remote field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaFormat {
    /// `- item` per line.
    #[default]
    Bullets,
    /// `1. item` per line.
    Numbered,
    /// One item per line, no marker.
    Lines,
    /// `<ul><li>item</li></ul>` for HTML fields.
    Html,
}

impl CriteriaFormat {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "bullets" => Some(Self::Bullets),
            "numbered" => Some(Self::Numbered),
            "lines" => Some(Self::Lines),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    /// Join criteria into a single field value.
    #[must_use]
    pub fn join(&self, criteria: &[String]) -> String {
        match self {
            Self::Bullets => criteria
                .iter()
                .map(|c| format!("- {c}"))
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Numbered => criteria
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{}. {c}", i + 1))
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Lines => criteria.join("\n"),
            Self::Html => {
                if criteria.is_empty() {
                    return String::new();
                }
                let items: String = criteria
                    .iter()
                    .map(|c| format!("<li>{}</li>", escape_html(c)))
                    .collect();
                format!("<ul>{items}</ul>")
            }
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// A single local attribute → remote field pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMapping {
    pub attribute: LocalAttribute,
    pub remote: String,
}

/// Everything needed to write one record type.
#[derive(Debug, Clone, Serialize)]
pub struct TableMapping {
    record_type: RecordType,
    table: String,
    fields: Vec<FieldMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_field: Option<String>,
    static_fields: serde_json::Map<String, serde_json::Value>,
    acceptance_criteria_format: CriteriaFormat,
}

impl TableMapping {
    #[must_use]
    pub const fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Remote table identifier.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Ordered field mapping.
    #[must_use]
    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// Remote field a local attribute maps to, if mapped.
    #[must_use]
    pub fn remote_field(&self, attribute: LocalAttribute) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.attribute == attribute)
            .map(|f| f.remote.as_str())
    }

    /// Remote field holding the title. Always mapped.
    #[must_use]
    pub fn title_field(&self) -> &str {
        self.remote_field(LocalAttribute::Title).unwrap_or("short_description")
    }

    /// Remote field referencing the parent record (stories only).
    #[must_use]
    pub fn parent_field(&self) -> Option<&str> {
        self.parent_field.as_deref()
    }

    /// Constant values written on every create and update.
    #[must_use]
    pub const fn static_fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.static_fields
    }

    #[must_use]
    pub const fn criteria_format(&self) -> CriteriaFormat {
        self.acceptance_criteria_format
    }
}

/// Immutable, validated mapping for one run.
#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    epic: TableMapping,
    story: TableMapping,
    priorities: PriorityTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_priority: Option<String>,
}

impl Schema {
    /// Load a schema from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns `SchemaError::Read` if the file cannot be read, or any
    /// validation error from [`Schema::from_yaml`].
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let source = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let schema = Self::from_yaml(&source)?;
        tracing::debug!(path = %path.display(), "Loaded schema");
        Ok(schema)
    }

    /// The builtin ServiceNow mapping.
    ///
    /// # Errors
    ///
    /// Only fails if the embedded YAML is broken.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_yaml(BUILTIN_SCHEMA)
    }

    /// Parse and validate a schema from YAML text.
    ///
    /// # Errors
    ///
    /// Returns a `SchemaError` for missing sections, unknown record types or
    /// attributes, invalid table identifiers, or a malformed priority table.
    pub fn from_yaml(source: &str) -> Result<Self, SchemaError> {
        let root: Value = serde_yaml::from_str(source)?;
        let Some(root) = root.as_mapping() else {
            return Err(SchemaError::MissingSection("tables".to_string()));
        };

        let tables = mapping_section(root, "tables", "tables")?;
        for key in tables.keys() {
            let name = scalar_key(key, "tables")?;
            if RecordType::from_name(&name).is_none() {
                return Err(SchemaError::UnknownRecordType(name));
            }
        }

        let epic = parse_table(tables, RecordType::Epic)?;
        let story = parse_table(tables, RecordType::Story)?;
        let priorities = parse_priorities(mapping_section(root, "priorities", "priorities")?)?;

        let default_priority = match root.get("default_priority") {
            None | Some(Value::Null) => None,
            Some(Value::String(key)) => {
                if !priorities.contains(key) {
                    return Err(SchemaError::MalformedPriorities(format!(
                        "default_priority '{key}' is not a declared priority"
                    )));
                }
                Some(key.clone())
            }
            Some(_) => {
                return Err(SchemaError::Malformed {
                    section: "default_priority".to_string(),
                    message: "expected a priority key".to_string(),
                });
            }
        };

        Ok(Self {
            epic,
            story,
            priorities,
            default_priority,
        })
    }

    /// Mapping for a record type.
    #[must_use]
    pub const fn table(&self, record_type: RecordType) -> &TableMapping {
        match record_type {
            RecordType::Epic => &self.epic,
            RecordType::Story => &self.story,
        }
    }

    #[must_use]
    pub const fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    /// Priority applied to records that declare none.
    #[must_use]
    pub fn default_priority(&self) -> Option<&str> {
        self.default_priority.as_deref()
    }
}

fn mapping_section<'a>(
    parent: &'a Mapping,
    key: &str,
    path: &str,
) -> Result<&'a Mapping, SchemaError> {
    match parent.get(key) {
        None | Some(Value::Null) => Err(SchemaError::MissingSection(path.to_string())),
        Some(Value::Mapping(m)) => Ok(m),
        Some(_) => Err(SchemaError::Malformed {
            section: path.to_string(),
            message: "expected a mapping".to_string(),
        }),
    }
}

fn scalar_key(key: &Value, section: &str) -> Result<String, SchemaError> {
    match key {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(SchemaError::Malformed {
            section: section.to_string(),
            message: "keys must be scalars".to_string(),
        }),
    }
}

fn string_value(value: &Value, section: &str) -> Result<String, SchemaError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        _ => Err(SchemaError::Malformed {
            section: section.to_string(),
            message: "expected a non-empty string".to_string(),
        }),
    }
}

fn is_valid_table_identifier(table: &str) -> bool {
    !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_table(tables: &Mapping, record_type: RecordType) -> Result<TableMapping, SchemaError> {
    let path = format!("tables.{record_type}");
    let section = mapping_section(tables, record_type.as_str(), &path)?;

    let table = match section.get("table") {
        None | Some(Value::Null) => return Err(SchemaError::MissingSection(format!("{path}.table"))),
        Some(Value::String(t)) => t.clone(),
        Some(other) => format!("{other:?}"),
    };
    if !is_valid_table_identifier(&table) {
        return Err(SchemaError::InvalidTable {
            record_type: record_type.to_string(),
            table,
        });
    }

    let fields_path = format!("{path}.fields");
    let mut fields: Vec<FieldMapping> = Vec::new();
    for (key, value) in mapping_section(section, "fields", &fields_path)? {
        let name = scalar_key(key, &fields_path)?;
        let attribute = LocalAttribute::from_name(&name)
            .filter(|a| a.applies_to(record_type))
            .ok_or_else(|| SchemaError::UnknownAttribute {
                record_type: record_type.to_string(),
                attribute: name.clone(),
            })?;
        let remote = string_value(value, &format!("{fields_path}.{name}"))?;
        if let Some(clash) = fields.iter().find(|f| f.remote == remote) {
            return Err(SchemaError::Malformed {
                section: fields_path,
                message: format!(
                    "'{}' and '{}' both map to remote field '{remote}'",
                    clash.attribute.as_str(),
                    attribute.as_str()
                ),
            });
        }
        fields.push(FieldMapping { attribute, remote });
    }
    if !fields.iter().any(|f| f.attribute == LocalAttribute::Title) {
        return Err(SchemaError::MissingSection(format!("{fields_path}.title")));
    }

    let parent_field = match (record_type, section.get("parent_field")) {
        (RecordType::Story, None | Some(Value::Null)) => {
            return Err(SchemaError::MissingSection(format!("{path}.parent_field")));
        }
        (RecordType::Story, Some(value)) => {
            let parent = string_value(value, &format!("{path}.parent_field"))?;
            if fields.iter().any(|f| f.remote == parent) {
                return Err(SchemaError::Malformed {
                    section: format!("{path}.parent_field"),
                    message: format!("'{parent}' is already used by the field mapping"),
                });
            }
            Some(parent)
        }
        (RecordType::Epic, None | Some(Value::Null)) => None,
        (RecordType::Epic, Some(_)) => {
            return Err(SchemaError::Malformed {
                section: format!("{path}.parent_field"),
                message: "epics have no parent".to_string(),
            });
        }
    };

    let mut static_fields = serde_json::Map::new();
    match section.get("static_fields") {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(m)) => {
            let static_path = format!("{path}.static_fields");
            for (key, value) in m {
                let name = scalar_key(key, &static_path)?;
                let json = serde_json::to_value(value).map_err(|e| SchemaError::Malformed {
                    section: static_path.clone(),
                    message: e.to_string(),
                })?;
                static_fields.insert(name, json);
            }
        }
        Some(_) => {
            return Err(SchemaError::Malformed {
                section: format!("{path}.static_fields"),
                message: "expected a mapping".to_string(),
            });
        }
    }

    let acceptance_criteria_format = match section.get("acceptance_criteria_format") {
        None | Some(Value::Null) => CriteriaFormat::default(),
        Some(Value::String(name)) => {
            CriteriaFormat::from_name(name).ok_or_else(|| SchemaError::Malformed {
                section: format!("{path}.acceptance_criteria_format"),
                message: format!("unknown format '{name}' (bullets, numbered, lines, html)"),
            })?
        }
        Some(_) => {
            return Err(SchemaError::Malformed {
                section: format!("{path}.acceptance_criteria_format"),
                message: "expected a format name".to_string(),
            });
        }
    };

    Ok(TableMapping {
        record_type,
        table,
        fields,
        parent_field,
        static_fields,
        acceptance_criteria_format,
    })
}

fn parse_priorities(section: &Mapping) -> Result<PriorityTable, SchemaError> {
    let mut entries = Vec::with_capacity(section.len());

    for (key, value) in section {
        let key = scalar_key(key, "priorities")?;
        let entry = match value {
            Value::Number(n) => PriorityEntry {
                code: n.as_i64().ok_or_else(|| non_integer(&key))?,
                key,
                label: None,
                guidance: None,
            },
            Value::Mapping(m) => {
                let code = m
                    .get("value")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| non_integer(&key))?;
                PriorityEntry {
                    key,
                    code,
                    label: m.get("label").and_then(Value::as_str).map(String::from),
                    guidance: m.get("guidance").and_then(Value::as_str).map(String::from),
                }
            }
            _ => return Err(non_integer(&key)),
        };
        entries.push(entry);
    }

    PriorityTable::new(entries)
}

fn non_integer(key: &str) -> SchemaError {
    SchemaError::MalformedPriorities(format!("priority '{key}' needs an integer value"))
}
