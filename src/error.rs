use thiserror::Error;

use crate::backend::BackendError;
use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Platform not found: {0}")]
    PlatformNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Session {session} has no running job")]
    NoRunningJob { session: u64 },

    #[error("Job {0} has no live container")]
    NoContainer(u64),

    #[error("SSH port pool exhausted")]
    PortsExhausted,

    #[error("Session {session} could not be expanded into jobs: {source}")]
    Expansion {
        session: String,
        #[source]
        source: BackendError,
    },

    #[error("Container engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Grid for platform {0} is not running")]
    GridClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GridError>;
