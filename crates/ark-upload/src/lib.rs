//! Upload sessions for ark.
//!
//! A session is a temporary staging area: clients stream files into it, each
//! file is digested with every algorithm the session was configured with in
//! the same pass that stores it, and a later commit references the uploads
//! by digest.
//!
//! Sessions are reference counted. [`UploadManager::get_session`] hands out a
//! [`SessionHandle`]; the session can only be deleted while at most one
//! handle is open, and it leaves the manager once it is marked for deletion
//! and its last handle is closed.
//!
//! Session records can be persisted through a [`Persistence`] so a restarted
//! process finds them again. [`JournalPersistence`] is a crash-recoverable
//! append-only journal; [`InMemoryPersistence`] suits tests and embedding.

pub mod error;
pub mod journal;
pub mod manager;
pub mod persistence;
pub mod session;
pub mod types;

pub use error::{PersistResult, PersistenceError, UploadError, UploadResult};
pub use journal::{JournalPersistence, SyncMode};
pub use manager::UploadManager;
pub use persistence::{InMemoryPersistence, Persistence};
pub use session::{SessionContent, SessionFixity, SessionHandle};
pub use types::{SessionConfig, SessionRecord, Upload};
