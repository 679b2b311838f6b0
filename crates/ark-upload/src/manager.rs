use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ark_store::WriteFs;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PersistenceError, UploadError, UploadResult};
use crate::persistence::Persistence;
use crate::session::{Session, SessionHandle};
use crate::types::SessionConfig;

pub(crate) struct ManagerInner {
    pub(crate) fs: Arc<dyn WriteFs>,
    pub(crate) dir: String,
    pub(crate) persist: Option<Arc<dyn Persistence>>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl ManagerInner {
    // Critical sections never leave the table half-updated, so a poisoned
    // lock still guards a consistent map.
    pub(crate) fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of upload sessions stored under one directory of a backing
/// filesystem.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl UploadManager {
    /// Store session content under `dir` on `fs`. Without `persist`, sessions
    /// are forgotten when the process exits.
    pub fn new(
        fs: Arc<dyn WriteFs>,
        dir: impl Into<String>,
        persist: Option<Arc<dyn Persistence>>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                fs,
                dir: dir.into(),
                persist,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The backing filesystem and the directory sessions live under.
    pub fn root(&self) -> (Arc<dyn WriteFs>, &str) {
        (Arc::clone(&self.inner.fs), &self.inner.dir)
    }

    /// Create a session and return its id. The session has no open handles
    /// until [`UploadManager::get_session`] is called.
    pub async fn new_session(&self, config: SessionConfig) -> UploadResult<String> {
        let session = Session::new(Uuid::new_v4().to_string(), config, Utc::now(), Vec::new(), 0);
        if let Some(persist) = &self.inner.persist {
            persist.create_session(&session.record()).await?;
        }
        let id = session.id.clone();
        self.inner.sessions().insert(id.clone(), Arc::new(session));
        info!(session_id = %id, "created upload session");
        Ok(id)
    }

    /// Open a handle on a session, restoring it from persistence if this
    /// process doesn't have it in memory.
    pub async fn get_session(&self, id: &str) -> UploadResult<SessionHandle> {
        {
            let table = self.inner.sessions();
            if let Some(session) = table.get(id) {
                session.acquire()?;
                return Ok(SessionHandle::new(Arc::clone(&self.inner), Arc::clone(session)));
            }
        }
        let persist = self
            .inner
            .persist
            .as_ref()
            .ok_or_else(|| UploadError::SessionNotFound(id.to_string()))?;
        let record = match persist.get_session(id).await {
            Ok(record) => record,
            Err(PersistenceError::NotFound(_)) => {
                return Err(UploadError::SessionNotFound(id.to_string()))
            }
            Err(e) => {
                warn!(session_id = id, error = %e, "failed to restore upload session");
                return Err(UploadError::SessionNotFound(id.to_string()));
            }
        };

        // Another caller may have installed the session while we were
        // reading it back.
        let mut table = self.inner.sessions();
        let session = match table.get(id) {
            Some(existing) => {
                existing.acquire()?;
                Arc::clone(existing)
            }
            None => {
                let session = Arc::new(Session::new(
                    record.id,
                    record.config,
                    record.created_at,
                    record.uploads,
                    1,
                ));
                table.insert(id.to_string(), Arc::clone(&session));
                debug!(session_id = id, "restored upload session from persistence");
                session
            }
        };
        drop(table);
        Ok(SessionHandle::new(Arc::clone(&self.inner), session))
    }

    /// Ids of all known sessions, sorted. Reads from persistence when it is
    /// configured.
    pub async fn session_ids(&self) -> UploadResult<Vec<String>> {
        if let Some(persist) = &self.inner.persist {
            return Ok(persist.session_ids().await?);
        }
        let mut ids: Vec<String> = self.inner.sessions().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Number of known sessions. Counts persisted sessions when persistence
    /// is configured.
    pub async fn len(&self) -> UploadResult<usize> {
        if let Some(persist) = &self.inner.persist {
            return Ok(persist.count_sessions().await?);
        }
        Ok(self.inner.sessions().len())
    }

    /// Number of sessions held in memory by this process.
    pub fn loaded(&self) -> usize {
        self.inner.sessions().len()
    }
}

impl fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadManager")
            .field("dir", &self.inner.dir)
            .field("persistent", &self.inner.persist.is_some())
            .field("loaded", &self.loaded())
            .finish()
    }
}
