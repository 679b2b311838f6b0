use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::{PersistResult, PersistenceError};
use crate::types::{SessionRecord, Upload};

/// Durable storage for session records.
#[async_trait]
pub trait Persistence: Send + Sync + fmt::Debug {
    /// Store a new session. Fails with [`PersistenceError::AlreadyExists`] if
    /// the id is taken.
    async fn create_session(&self, record: &SessionRecord) -> PersistResult<()>;

    /// Append an upload to an existing session.
    async fn create_upload(&self, session_id: &str, upload: &Upload) -> PersistResult<()>;

    /// Ids of all stored sessions, sorted.
    async fn session_ids(&self) -> PersistResult<Vec<String>>;

    /// The session with all of its uploads.
    async fn get_session(&self, id: &str) -> PersistResult<SessionRecord>;

    /// Delete the session and its uploads. Deleting a missing session is not
    /// an error.
    async fn delete_session(&self, id: &str) -> PersistResult<()>;

    async fn count_sessions(&self) -> PersistResult<usize>;
}

/// Non-durable [`Persistence`] held in memory.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn create_session(&self, record: &SessionRecord) -> PersistResult<()> {
        let mut sessions = self.write();
        if sessions.contains_key(&record.id) {
            return Err(PersistenceError::AlreadyExists(record.id.clone()));
        }
        sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn create_upload(&self, session_id: &str, upload: &Upload) -> PersistResult<()> {
        let mut sessions = self.write();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| PersistenceError::NotFound(session_id.to_string()))?;
        record.uploads.push(upload.clone());
        Ok(())
    }

    async fn session_ids(&self) -> PersistResult<Vec<String>> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_session(&self, id: &str) -> PersistResult<SessionRecord> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    async fn delete_session(&self, id: &str) -> PersistResult<()> {
        self.write().remove(id);
        Ok(())
    }

    async fn count_sessions(&self) -> PersistResult<usize> {
        Ok(self.read().len())
    }
}
