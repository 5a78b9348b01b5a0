use replay_core::error::ErrorKind;

use crate::bus::BusError;
use crate::store::StoreError;

/// Failure of a single pipeline operation. None of these stop the control loop.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("session {session_id} not found")]
    NotFound { session_id: u64 },

    #[error("project {project_id} not found")]
    ProjectNotFound { project_id: u32 },

    #[error("project with key '{project_key}' not found")]
    ProjectKeyNotFound { project_key: String },

    #[error("session {session_id} already started")]
    DuplicateSession { session_id: u64 },

    #[error("session {session_id} already ended with duration {duration}")]
    DuplicateSessionEnd { session_id: u64, duration: u64 },

    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error(transparent)]
    Upstream(#[from] StoreError),

    #[error("transaction for session {session_id} rolled back: {source}")]
    Transaction {
        session_id: u64,
        #[source]
        source: StoreError,
    },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("{} session batch(es) failed to flush", failed.len())]
    BatchFlush { failed: Vec<u64> },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::NotFound { .. }
            | PipelineError::ProjectNotFound { .. }
            | PipelineError::ProjectKeyNotFound { .. } => ErrorKind::NotFound,
            PipelineError::DuplicateSession { .. } => ErrorKind::DuplicateSession,
            PipelineError::DuplicateSessionEnd { .. } => ErrorKind::DuplicateSessionEnd,
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::Upstream(_) | PipelineError::Bus(_) => ErrorKind::Upstream,
            PipelineError::Transaction { .. } => ErrorKind::Transaction,
            PipelineError::BatchFlush { .. } => ErrorKind::BatchFlush,
        }
    }
}
