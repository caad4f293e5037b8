//! Validate command implementation.

use std::path::Path;

use colored::Colorize;
use serde::Serialize;

use crate::cli::DocumentArgs;
use crate::error::Result;
use crate::model::Document;

use super::{load_schema, load_settings, match_policy};

#[derive(Serialize)]
struct ValidateOutput<'a> {
    valid: bool,
    epics: usize,
    stories: usize,
    warnings: &'a [String],
}

/// Parse and validate a document. Never touches the network.
///
/// # Errors
///
/// Returns `Error::Validation` listing every defect, or a schema/config/I/O
/// error.
pub fn execute(args: &DocumentArgs, config: Option<&Path>, json: bool) -> Result<()> {
    let settings = load_settings(config)?;
    let schema = load_schema(args.schema.as_deref(), &settings)?;
    let policy = match_policy(args.match_policy, &settings);

    let document = Document::load(&args.document, &schema, policy)?;

    if json {
        let output = ValidateOutput {
            valid: true,
            epics: document.epics().len(),
            stories: document.stories().len(),
            warnings: document.warnings(),
        };
        println!("{}", serde_json::to_string(&output)?);
        return Ok(());
    }

    println!(
        "{} {} ({} epics, {} stories)",
        "Valid:".green().bold(),
        args.document.display(),
        document.epics().len(),
        document.stories().len()
    );
    for warning in document.warnings() {
        println!("  {} {warning}", "warning:".yellow());
    }
    Ok(())
}
