//! Version command implementation.

use crate::error::Result;
use crate::schema::Schema;
use serde::Serialize;

#[derive(Serialize)]
struct VersionOutput<'a> {
    version: &'a str,
    build: &'a str,
    builtin_schema: bool,
}

/// Execute the version command.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn execute(json: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let build = if cfg!(debug_assertions) {
        "dev"
    } else {
        "release"
    };
    let builtin_schema = Schema::builtin().is_ok();

    if json {
        let output = VersionOutput {
            version,
            build,
            builtin_schema,
        };
        let payload = serde_json::to_string(&output)?;
        println!("{payload}");
        return Ok(());
    }

    println!("backlog version {version} ({build})");
    if !builtin_schema {
        eprintln!("warning: builtin schema failed to load");
    }
    Ok(())
}
