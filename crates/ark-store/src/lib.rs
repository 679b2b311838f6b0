//! Versioned object storage for ark.
//!
//! An object is an immutable-once-committed, versioned package of files
//! identified by a caller-chosen id. Each version records a complete mapping
//! from digest to logical paths; the object-wide manifest maps each digest to
//! the content file holding its bytes.
//!
//! # Layers
//!
//! - [`WriteFs`] -- the backing filesystem contract; [`LocalFs`] implements it
//!   over a local directory
//! - [`VersionedBackend`] -- versioned-object semantics on top of a
//!   filesystem; [`InventoryBackend`] is the reference implementation
//! - [`StorageRoot`] -- the access protocol: every read holds a shared lease
//!   on the object id for the life of the returned handle, every commit or
//!   delete holds an exclusive lease for the whole operation
//!
//! # Design Rules
//!
//! 1. Lease acquisition never waits; contention is an immediate error.
//! 2. A failed read releases its lease before the error is returned.
//! 3. Commits and deletes run detached from the caller once the exclusive
//!    lease is held, and release it unconditionally when they finish.
//! 4. Object-not-found is never reported as a lock error.

pub mod backend;
pub mod error;
pub mod fs;
pub mod inventory;
pub mod reader;
pub mod root;
pub mod stage;

pub use backend::{ObjectRef, VersionedBackend};
pub use error::{StoreError, StoreResult};
pub use fs::{DirEntry, LocalFs, WriteFs};
pub use inventory::{Inventory, InventoryBackend, Version};
pub use reader::DigestReader;
pub use root::{ObjectManifest, ObjectVersion, StorageRoot};
pub use stage::{
    CommitOptions, ContentRef, ContentSource, DigestMap, FileInfo, FixitySource, Stage, User,
};
