//! Command implementations.

pub mod completions;
pub mod push;
pub mod schema;
pub mod show;
pub mod validate;
pub mod version;

use std::path::Path;

use crate::cli::MatchArg;
use crate::config::{Settings, load_config};
use crate::error::Result;
use crate::model::MatchPolicy;
use crate::schema::Schema;

/// Resolve settings from the config file and environment.
pub(crate) fn load_settings(config: Option<&Path>) -> Result<Settings> {
    let file = load_config(config)?;
    Settings::from_environment(&file)
}

/// `--schema`, then the configured `schema_path`, then the builtin mapping.
pub(crate) fn load_schema(explicit: Option<&Path>, settings: &Settings) -> Result<Schema> {
    match explicit.or(settings.schema_path.as_deref()) {
        Some(path) => Ok(Schema::load(path)?),
        None => {
            tracing::debug!("Using builtin schema");
            Ok(Schema::builtin()?)
        }
    }
}

/// `--match`, then the configured policy.
pub(crate) fn match_policy(arg: Option<MatchArg>, settings: &Settings) -> MatchPolicy {
    arg.map_or(settings.match_policy, MatchPolicy::from)
}
