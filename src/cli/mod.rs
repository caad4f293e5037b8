//! CLI definitions using clap.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::MatchPolicy;

pub mod commands;

/// backlog - push a reviewed epic/story document into a Table API backlog
#[derive(Parser, Debug)]
#[command(name = "backlog", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.backlog-sync/config.json)
    #[arg(long, global = true, env = "BACKLOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile a document with the remote backlog
    Push(PushArgs),

    /// Parse and validate a document without touching the remote
    Validate(DocumentArgs),

    /// Print the epic/story tree of a document
    Show(DocumentArgs),

    /// Print the resolved schema mapping
    Schema {
        /// Schema file (default: builtin ServiceNow mapping)
        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Document and schema selection shared by document commands.
#[derive(Args, Debug, Clone)]
pub struct DocumentArgs {
    /// Intermediate document (JSON)
    #[arg(default_value = "stories.json")]
    pub document: PathBuf,

    /// Schema file (default: config `schema_path`, then the builtin mapping)
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// How titles are matched
    #[arg(long = "match", value_enum)]
    pub match_policy: Option<MatchArg>,
}

#[derive(Args, Debug, Clone)]
pub struct PushArgs {
    #[command(flatten)]
    pub doc: DocumentArgs,

    /// Compute the plan without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Also update records that already exist (with --dry-run: preview them)
    #[arg(long)]
    pub update: bool,

    /// Skip the remote snapshot; every record is planned as new
    #[arg(long, requires = "dry_run")]
    pub offline: bool,

    /// Save backfilled remote ids into the document
    #[arg(long, conflicts_with = "dry_run")]
    pub write_back: bool,

    /// Maximum concurrent writes within a level
    #[arg(long)]
    pub concurrency: Option<usize>,
}

/// Title matching policy.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchArg {
    /// Case-sensitive exact match (default)
    Exact,
    /// Ignore case
    CaseInsensitive,
    /// Ignore case and collapse whitespace
    Normalized,
}

impl From<MatchArg> for MatchPolicy {
    fn from(arg: MatchArg) -> Self {
        match arg {
            MatchArg::Exact => Self::Exact,
            MatchArg::CaseInsensitive => Self::CaseInsensitive,
            MatchArg::Normalized => Self::Normalized,
        }
    }
}

/// Supported shells for completions.
#[derive(clap::ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}
