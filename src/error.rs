//! Error types for the registry, installer and supervisor boundaries

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to the backend registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The configured endpoint is not a usable URL
    #[error("invalid registry endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Connection-level failure (refused, reset, TLS, ...)
    #[error("registry transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A bounded registry call did not finish in time
    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),

    /// The registry answered with a non-success status
    #[error("registry returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The registry answered with something we could not decode
    #[error("malformed registry response: {0}")]
    Decode(String),

    /// The requested resume revision is older than the retained history
    #[error("revision {requested} has been compacted (oldest retained: {compact_revision})")]
    Compacted { requested: i64, compact_revision: i64 },

    /// The registry cancelled the watch for another reason
    #[error("watch cancelled by registry: {0}")]
    Cancelled(String),
}

impl RegistryError {
    pub fn is_compacted(&self) -> bool {
        matches!(self, RegistryError::Compacted { .. })
    }

    /// Reopening the stream at the same position would fail the same way
    pub fn needs_resync(&self) -> bool {
        matches!(
            self,
            RegistryError::Compacted { .. } | RegistryError::Decode(_)
        )
    }
}

/// Failures while publishing a rendered configuration
///
/// Either way the live configuration is left exactly as it was.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Writing the staging file or renaming it into place failed
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The proxy's syntax checker rejected the staged file
    #[error("configuration at {path} failed validation: {detail}")]
    ValidationFailed { path: PathBuf, detail: String },
}

/// Failures starting the proxy process. Always fatal.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn proxy '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures before the watch loop starts. Always fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The initial backend snapshot could not be read
    #[error("initial backend fetch failed: {0}")]
    Fetch(#[source] RegistryError),

    #[error(transparent)]
    Spawn(#[from] SupervisorError),
}
