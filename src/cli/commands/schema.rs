//! Schema command implementation.

use std::path::Path;

use colored::Colorize;

use crate::error::Result;
use crate::schema::{RecordType, Schema};

use super::{load_schema, load_settings};

/// Print the schema that a push would use.
///
/// # Errors
///
/// Returns an error if the schema cannot be loaded or validated.
pub fn execute(schema: Option<&Path>, config: Option<&Path>, json: bool) -> Result<()> {
    let settings = load_settings(config)?;
    let schema = load_schema(schema, &settings)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    print_schema(&schema);
    Ok(())
}

fn print_schema(schema: &Schema) {
    for record_type in RecordType::ALL {
        let table = schema.table(record_type);
        println!(
            "{} {}",
            format!("{record_type}:").blue().bold(),
            table.table()
        );
        for field in table.fields() {
            println!("  {:<22} -> {}", field.attribute.as_str(), field.remote);
        }
        if let Some(parent) = table.parent_field() {
            println!("  {:<22} -> {parent}", "(parent)".dimmed());
        }
        for (name, value) in table.static_fields() {
            println!("  {:<22} = {value}", name.dimmed());
        }
        println!();
    }

    println!("{}", "Priorities:".blue().bold());
    for entry in schema.priorities().entries() {
        let marker = if schema.default_priority() == Some(entry.key.as_str()) {
            " (default)".green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<10} {:>3}  {}{marker}",
            entry.key,
            entry.code,
            schema.priorities().label(&entry.key)
        );
        if let Some(guidance) = &entry.guidance {
            println!("  {:<14} {}", "", guidance.dimmed());
        }
    }
}
