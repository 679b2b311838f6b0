use ark_digest::DigestError;
use thiserror::Error;

/// Errors from a session persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type PersistResult<T> = Result<T, PersistenceError>;

/// Errors from upload sessions.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("upload session {0} is being deleted")]
    SessionDeleting(String),

    #[error("upload session {0} is in use and can't be deleted")]
    SessionInUse(String),

    /// The session is configured with an algorithm that can't be computed.
    #[error(transparent)]
    DigestAlgorithm(#[from] DigestError),

    #[error("deleting upload session {id}: {}", .reasons.join("; "))]
    DeleteFailed { id: String, reasons: Vec<String> },

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type UploadResult<T> = Result<T, UploadError>;
