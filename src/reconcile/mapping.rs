//! Local record → remote field payload.
//!
//! The builders emit mapped attributes and the parent reference only.
//! Creates add the schema's static fields with [`with_static_fields`], under
//! the mapped attributes so a mapping can override them.

use serde_json::Value;

use crate::model::{Epic, Story};
use crate::remote::Fields;
use crate::schema::{LocalAttribute, RecordType, Schema};

/// Payload for an epic update; see [`with_static_fields`] for creates.
#[must_use]
pub fn epic_fields(schema: &Schema, epic: &Epic) -> Fields {
    let table = schema.table(RecordType::Epic);
    let mut fields = Fields::new();

    for mapping in table.fields() {
        let value = match mapping.attribute {
            LocalAttribute::Title => Some(Value::from(epic.title.as_str())),
            LocalAttribute::Description => Some(Value::from(epic.description.as_str())),
            LocalAttribute::Priority => priority_code(schema, epic.priority.as_deref()),
            LocalAttribute::Key => epic.key.as_deref().map(Value::from),
            LocalAttribute::AcceptanceCriteria | LocalAttribute::GapId => None,
        };
        if let Some(value) = value {
            fields.insert(mapping.remote.clone(), value);
        }
    }

    fields
}

/// Payload for a story update.
///
/// `parent_id` is `None` only when planning against an epic that does not
/// exist yet. A mapped `acceptance_criteria` field is always sent, empty
/// when the story has none, so an update clears stale criteria.
#[must_use]
pub fn story_fields(schema: &Schema, story: &Story, parent_id: Option<&str>) -> Fields {
    let table = schema.table(RecordType::Story);
    let mut fields = Fields::new();

    for mapping in table.fields() {
        let value = match mapping.attribute {
            LocalAttribute::Title => Some(Value::from(story.title.as_str())),
            LocalAttribute::Description => Some(Value::from(story.description.as_str())),
            LocalAttribute::Priority => priority_code(schema, story.priority.as_deref()),
            LocalAttribute::AcceptanceCriteria => Some(Value::from(
                table.criteria_format().join(&story.acceptance_criteria),
            )),
            LocalAttribute::GapId => story.gap_id.as_deref().map(Value::from),
            LocalAttribute::Key => None,
        };
        if let Some(value) = value {
            fields.insert(mapping.remote.clone(), value);
        }
    }

    if let (Some(field), Some(id)) = (table.parent_field(), parent_id) {
        fields.insert(field.to_string(), Value::from(id));
    }

    fields
}

/// Create payload: the table's static fields overlaid with `fields`.
#[must_use]
pub fn with_static_fields(schema: &Schema, record_type: RecordType, fields: Fields) -> Fields {
    let mut payload = schema.table(record_type).static_fields().clone();
    payload.extend(fields);
    payload
}

/// Numeric code for a priority key, falling back to the schema default.
fn priority_code(schema: &Schema, key: Option<&str>) -> Option<Value> {
    key.or_else(|| schema.default_priority())
        .and_then(|k| schema.priorities().code(k))
        .map(Value::from)
}
