use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::error::LockError;

/// Default maximum number of keys a [`KeyedLock`] tracks at once.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Whether a lease is shared or exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// Snapshot of one tracked key, for introspection and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockState {
    pub writing: bool,
    pub refs: usize,
}

#[derive(Debug)]
struct Entry {
    writing: bool,
    refs: usize,
}

struct LockTable {
    capacity: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl LockTable {
    // Every critical section leaves the map consistent, so a poisoned mutex
    // still guards valid data.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                entries.remove(key);
                trace!(key, "lock entry removed");
            }
        }
    }
}

/// A table of reader/writer leases keyed by resource name.
///
/// Cloning a `KeyedLock` yields another handle to the same table. Tables are
/// owned by whoever constructs them; there is no process-wide instance.
#[derive(Clone)]
pub struct KeyedLock {
    table: Arc<LockTable>,
}

impl KeyedLock {
    /// Create a lock table that tracks at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Arc::new(LockTable {
                capacity,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquire a shared lease on `key`.
    ///
    /// Fails with [`LockError::ReadLock`] if a writer holds the key and with
    /// [`LockError::Capacity`] if a new entry would exceed the capacity.
    pub fn acquire_read(&self, key: &str) -> Result<LockGuard, LockError> {
        let mut entries = self.table.entries();
        match entries.get_mut(key) {
            Some(entry) if entry.writing => return Err(LockError::ReadLock),
            Some(entry) => entry.refs += 1,
            None => {
                if entries.len() >= self.table.capacity {
                    return Err(LockError::Capacity);
                }
                entries.insert(
                    key.to_string(),
                    Entry {
                        writing: false,
                        refs: 1,
                    },
                );
            }
        }
        drop(entries);
        Ok(self.guard(key, LockMode::Read))
    }

    /// Acquire an exclusive lease on `key`.
    ///
    /// Any existing entry for `key`, reading or writing, fails with
    /// [`LockError::WriteLock`].
    pub fn acquire_write(&self, key: &str) -> Result<LockGuard, LockError> {
        let mut entries = self.table.entries();
        if entries.contains_key(key) {
            return Err(LockError::WriteLock);
        }
        if entries.len() >= self.table.capacity {
            return Err(LockError::Capacity);
        }
        entries.insert(
            key.to_string(),
            Entry {
                writing: true,
                refs: 1,
            },
        );
        drop(entries);
        Ok(self.guard(key, LockMode::Write))
    }

    /// Current state of `key`, or `None` if it is not tracked.
    pub fn state(&self, key: &str) -> Option<LockState> {
        self.table.entries().get(key).map(|e| LockState {
            writing: e.writing,
            refs: e.refs,
        })
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.entries().len()
    }

    /// Returns `true` if no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of keys tracked at once.
    pub fn capacity(&self) -> usize {
        self.table.capacity
    }

    fn guard(&self, key: &str, mode: LockMode) -> LockGuard {
        trace!(key, ?mode, "lock acquired");
        LockGuard {
            table: Arc::clone(&self.table),
            key: key.to_string(),
            mode,
        }
    }
}

impl Default for KeyedLock {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for KeyedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLock")
            .field("capacity", &self.table.capacity)
            .field("tracked", &self.len())
            .finish()
    }
}

/// A held lease on one key. Releasing happens exactly once: on
/// [`LockGuard::release`] or when the guard is dropped.
#[must_use = "dropping a LockGuard releases the lease immediately"]
pub struct LockGuard {
    table: Arc<LockTable>,
    key: String,
    mode: LockMode,
}

impl LockGuard {
    /// The key this lease covers.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this lease is shared or exclusive.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key);
        trace!(key = %self.key, mode = ?self.mode, "lock released");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}
