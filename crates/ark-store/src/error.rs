use ark_digest::DigestError;
use ark_lock::LockError;

/// Errors from versioned object storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The object exists but has no such version.
    #[error("version {version} not found for object {object_id}")]
    VersionNotFound { object_id: String, version: u32 },

    /// The version has no file at the logical path.
    #[error("no file {path:?} in object {object_id}")]
    FileNotFound { object_id: String, path: String },

    /// Lease contention or capacity exhaustion on the object id.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The commit expected a different next version number.
    #[error("object {object_id}: commit expected version {expected}, next version is {actual}")]
    HeadConflict {
        object_id: String,
        expected: u32,
        actual: u32,
    },

    /// The staged state is malformed or incompatible with the object.
    #[error("invalid stage: {0}")]
    InvalidStage(String),

    /// No content source could provide bytes for a new digest.
    #[error("no content source provides digest {digest}")]
    MissingContent { digest: String },

    /// Copied content didn't hash to the digest it was staged under.
    #[error("digest mismatch for {path}: expected {expected}, computed {computed}")]
    DigestMismatch {
        path: String,
        expected: String,
        computed: String,
    },

    #[error(transparent)]
    Digest(#[from] DigestError),

    /// Inventory encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the backing filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns `true` for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::VersionNotFound { .. } | Self::FileNotFound { .. }
        )
    }

    /// The lock error, if this is lease contention.
    pub fn as_lock_error(&self) -> Option<LockError> {
        match self {
            Self::Lock(e) => Some(*e),
            _ => None,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
