//! Error types for the backlog CLI.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (4=validation, 5=auth, 6=remote, etc.)
//! - Context-aware recovery hints
//! - Structured JSON output for `--json` consumers

use std::path::PathBuf;
use thiserror::Error;

use crate::model::ValidationErrors;
use crate::remote::RemoteError;
use crate::schema::SchemaError;

/// Result type alias for backlog operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
///
/// Each code maps to a SCREAMING_SNAKE string and a category-based
/// exit code. Scripts match on the string or the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Validation (exit 4)
    ValidationFailed,
    InvalidArgument,

    // Auth (exit 5)
    AuthFailed,

    // Remote / sync (exit 6)
    RemoteError,
    SyncFailed,

    // Schema / config (exit 7)
    SchemaError,
    ConfigError,

    // I/O (exit 8)
    DocumentNotFound,
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::AuthFailed => "AUTH_FAILED",
            Self::RemoteError => "REMOTE_ERROR",
            Self::SyncFailed => "SYNC_FAILED",
            Self::SchemaError => "SCHEMA_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::DocumentNotFound => "DOCUMENT_NOT_FOUND",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::ValidationFailed | Self::InvalidArgument => 4,
            Self::AuthFailed => 5,
            Self::RemoteError | Self::SyncFailed => 6,
            Self::SchemaError | Self::ConfigError => 7,
            Self::DocumentNotFound | Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether running the same command again (possibly after fixing input)
    /// can succeed.
    ///
    /// True for validation errors and partial runs: re-running is how a
    /// partially failed push recovers.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed | Self::InvalidArgument | Self::RemoteError | Self::SyncFailed
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in backlog operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("Run finished with {failed} failed record(s) out of {total}")]
    RunFailed { failed: usize, total: usize },

    #[error("Document not found: {}", path.display())]
    DocumentNotFound { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationFailed,
            Self::Schema(_) => ErrorCode::SchemaError,
            Self::Remote(RemoteError::Auth(_)) => ErrorCode::AuthFailed,
            Self::Remote(_) => ErrorCode::RemoteError,
            Self::RunFailed { .. } => ErrorCode::SyncFailed,
            Self::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Validation(_) => Some(
                "Fix the records listed above, then check again with `backlog validate <doc>`."
                    .to_string(),
            ),

            Self::Schema(_) => Some(
                "Run `backlog schema` to see the builtin mapping and compare it with your file."
                    .to_string(),
            ),

            Self::Remote(RemoteError::Auth(_)) => Some(
                "Check BACKLOG_AUTH and the matching credentials \
                 (BACKLOG_USERNAME/BACKLOG_PASSWORD, BACKLOG_TOKEN or \
                 BACKLOG_CLIENT_ID/BACKLOG_CLIENT_SECRET), or ~/.backlog-sync/config.json."
                    .to_string(),
            ),

            Self::Remote(RemoteError::Transport(_)) => Some(
                "Check BACKLOG_INSTANCE_URL and network access to the instance.".to_string(),
            ),

            Self::RunFailed { .. } => Some(
                "Re-run the same command: records created so far are matched by title and \
                 only the failed ones are attempted again."
                    .to_string(),
            ),

            Self::DocumentNotFound { path } => Some(format!(
                "No document at {}. Pass the path to the generated stories file.",
                path.display()
            )),

            Self::Config(msg) if msg.contains("instance") => Some(
                "Set BACKLOG_INSTANCE_URL or `instance_url` in ~/.backlog-sync/config.json, \
                 or use `--dry-run --offline`."
                    .to_string(),
            ),

            Self::Remote(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::Other(_) => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Self::Validation(errors) = self {
            obj["error"]["details"] = errors
                .iter()
                .map(|e| serde_json::Value::String(e.to_string()))
                .collect();
        }

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
