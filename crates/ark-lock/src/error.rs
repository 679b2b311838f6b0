use thiserror::Error;

/// Errors from lease acquisition. All of them are routine outcomes of
/// contention, never faults.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LockError {
    /// A shared lease was requested while the resource is being modified.
    #[error("can't acquire lock because the resource is being modified")]
    ReadLock,

    /// An exclusive lease was requested while the resource is in use.
    #[error("can't acquire exclusive lock because the resource is in use")]
    WriteLock,

    /// The table already tracks the maximum number of keys.
    #[error("resource lock capacity limit reached")]
    Capacity,
}
