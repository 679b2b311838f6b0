//! Keyed reader/writer leases for the ark object store.
//!
//! A [`KeyedLock`] tracks, per opaque resource key, either a count of shared
//! readers or a single exclusive writer. Acquisition never waits: contention
//! is reported immediately as a [`LockError`] and retry policy is left to the
//! caller.
//!
//! # Leases
//!
//! Every successful acquire returns a [`LockGuard`]. The guard is the only way
//! to release the lease, either explicitly with [`LockGuard::release`] or by
//! dropping it, so each lease is released exactly once.
//!
//! # Capacity
//!
//! The table is bounded by a maximum number of simultaneously tracked keys.
//! Creating an entry beyond that bound fails with [`LockError::Capacity`];
//! joining an existing read entry does not count against it.

pub mod error;
pub mod keyed;

pub use error::LockError;
pub use keyed::{KeyedLock, LockGuard, LockMode, LockState, DEFAULT_CAPACITY};
