//! CLI error type.

use firemirror_storage::StorageError;
use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A required global argument was not given.
    #[error("{argument} is required for {command}")]
    MissingArgument {
        /// Subcommand name.
        command: String,
        /// Missing flag.
        argument: &'static str,
    },

    /// No replica file exists for the namespace.
    #[error("no replica found at {0}")]
    NotFound(String),

    /// The replica failed verification.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The output format is not supported.
    #[error("unknown format '{0}' (expected text or json)")]
    UnknownFormat(String),

    /// Storage layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// JSON output failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
