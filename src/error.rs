//! Error types for the library surface.
//!
//! Most failure modes in portrack degrade instead of erroring (spawn failures become
//! log lines, denied introspection becomes "unknown occupant"). What remains is port
//! exhaustion and the I/O behind the persisted documents.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Every step of the suggestion chain was exhausted.
    #[error("no port available for tech stack '{tech_stack}'")]
    NoPortAvailable { tech_stack: String },

    /// Port 0 cannot be claimed.
    #[error("invalid port {0}")]
    InvalidPort(u16),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown project: {0}")]
    ProjectNotFound(String),

    #[error("unknown service '{service}' in project '{project}'")]
    ServiceNotFound { project: String, service: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
