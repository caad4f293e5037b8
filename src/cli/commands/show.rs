//! Show command implementation.

use std::path::Path;

use colored::Colorize;

use crate::cli::DocumentArgs;
use crate::error::Result;
use crate::model::Document;
use crate::schema::Schema;

use super::{load_schema, load_settings, match_policy};

/// Print the document as an epic/story tree.
///
/// # Errors
///
/// Returns an error if the document does not load or validate.
pub fn execute(args: &DocumentArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let settings = load_settings(config)?;
    let schema = load_schema(args.schema.as_deref(), &settings)?;
    let policy = match_policy(args.match_policy, &settings);

    let document = Document::load(&args.document, &schema, policy)?;

    if json {
        println!("{}", document.to_json_pretty()?);
        return Ok(());
    }

    print_tree(&document, &schema);
    Ok(())
}

fn priority_tag(schema: &Schema, key: Option<&str>) -> String {
    match key.or_else(|| schema.default_priority()) {
        Some(key) => format!("[{}]", schema.priorities().label(key)),
        None => String::new(),
    }
}

fn print_tree(document: &Document, schema: &Schema) {
    for epic in document.epics() {
        let remote = epic
            .remote_id
            .as_deref()
            .map(|id| format!(" {}", id.dimmed()))
            .unwrap_or_default();
        println!(
            "{} {}{remote}",
            epic.title.bold(),
            priority_tag(schema, epic.priority.as_deref()).cyan()
        );

        for story in document.stories_of(epic) {
            let gap = story
                .gap_id
                .as_deref()
                .map(|g| format!("{g} "))
                .unwrap_or_default();
            println!(
                "  - {gap}{} {}",
                story.title,
                priority_tag(schema, story.priority.as_deref()).cyan()
            );
            for criterion in &story.acceptance_criteria {
                println!("      {} {}", "*".dimmed(), criterion);
            }
        }
        println!();
    }

    println!(
        "{} epics, {} stories",
        document.epics().len(),
        document.stories().len()
    );
}
