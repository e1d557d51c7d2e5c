use std::path::PathBuf;

use thiserror::Error;

/// Error kinds surfaced by the core.
///
/// Only [`RippleError::FileNotInGraph`] is expected to reach callers under
/// normal operation. Everything a user can cause (unreadable files, broken
/// configs, missing version control) is recovered locally and logged; the
/// corresponding variants exist so diagnostics carry a precise kind.
#[derive(Debug, Error)]
pub enum RippleError {
    #[error("file is not part of the dependency graph: {path}")]
    FileNotInGraph { path: PathBuf },

    #[error("could not read '{path}'")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration file '{path}': {reason}")]
    MalformedConfig { path: PathBuf, reason: String },

    #[error("version control unavailable: {0}")]
    VcsUnavailable(String),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, RippleError>;
