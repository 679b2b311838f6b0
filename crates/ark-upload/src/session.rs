use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ark_digest::{DigestSet, MultiDigester};
use ark_store::fs::join;
use ark_store::{ContentRef, ContentSource, DigestReader, FixitySource, WriteFs};
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{UploadError, UploadResult};
use crate::manager::ManagerInner;
use crate::types::{SessionConfig, SessionRecord, Upload};

#[derive(Debug)]
struct SessionState {
    refs: usize,
    deleting: bool,
}

/// Shared state of one session. Always reached through the manager's table
/// or a [`SessionHandle`].
pub(crate) struct Session {
    pub(crate) id: String,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    uploads: RwLock<Vec<Upload>>,
    // Serializes writes and lets delete wait out an in-flight write.
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        config: SessionConfig,
        created_at: DateTime<Utc>,
        uploads: Vec<Upload>,
        refs: usize,
    ) -> Self {
        Self {
            id,
            config,
            created_at,
            state: Mutex::new(SessionState {
                refs,
                deleting: false,
            }),
            uploads: RwLock::new(uploads),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn uploads(&self) -> RwLockReadGuard<'_, Vec<Upload>> {
        self.uploads.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn uploads_mut(&self) -> RwLockWriteGuard<'_, Vec<Upload>> {
        self.uploads.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one more reference, unless the session is being deleted.
    pub(crate) fn acquire(&self) -> UploadResult<()> {
        let mut state = self.state();
        if state.deleting {
            return Err(UploadError::SessionDeleting(self.id.clone()));
        }
        state.refs += 1;
        Ok(())
    }

    fn is_deleting(&self) -> bool {
        self.state().deleting
    }

    /// Mark the session deleted and take one reference for the task that
    /// removes it, so the session stays in the table until removal is done.
    fn begin_delete(&self) -> UploadResult<()> {
        let mut state = self.state();
        if state.deleting {
            return Err(UploadError::SessionDeleting(self.id.clone()));
        }
        if state.refs > 1 {
            return Err(UploadError::SessionInUse(self.id.clone()));
        }
        state.deleting = true;
        state.refs += 1;
        Ok(())
    }

    pub(crate) fn record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            config: self.config.clone(),
            created_at: self.created_at,
            uploads: self.uploads().clone(),
        }
    }
}

/// An open reference to an upload session.
///
/// The reference is released exactly once, by [`SessionHandle::close`] or
/// when the handle is dropped.
pub struct SessionHandle {
    manager: Arc<ManagerInner>,
    session: Arc<Session>,
    released: bool,
}

impl SessionHandle {
    pub(crate) fn new(manager: Arc<ManagerInner>, session: Arc<Session>) -> Self {
        Self {
            manager,
            session,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.session.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.session.created_at
    }

    /// Snapshot of the uploads so far.
    pub fn uploads(&self) -> Vec<Upload> {
        self.session.uploads().clone()
    }

    pub fn record(&self) -> SessionRecord {
        self.session.record()
    }

    /// The backing filesystem and this session's directory on it.
    pub fn root(&self) -> (Arc<dyn WriteFs>, String) {
        (Arc::clone(&self.manager.fs), self.dir())
    }

    fn dir(&self) -> String {
        join(&self.manager.dir, &self.session.id)
    }

    /// Open another reference to the same session.
    pub fn try_clone(&self) -> UploadResult<SessionHandle> {
        self.session.acquire()?;
        Ok(Self::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.session),
        ))
    }

    /// Stream `reader` into a new file in the session, digesting it with
    /// every configured algorithm on the way.
    ///
    /// The upload is recorded only once its bytes are stored and, when
    /// persistence is configured, its record is saved; on any failure the
    /// stored file is removed and nothing is recorded. Once the bytes are
    /// stored, recording finishes on its own task: dropping the returned
    /// future can't leave a persisted upload the session doesn't list.
    pub async fn write<R>(&self, reader: R) -> UploadResult<Upload>
    where
        R: AsyncRead + Send + Unpin,
    {
        let digester = MultiDigester::new(&self.session.config.digest_algorithms)?;
        let writing = Arc::clone(&self.session.write_lock).lock_owned().await;
        if self.session.is_deleting() {
            return Err(UploadError::SessionDeleting(self.session.id.clone()));
        }

        let name = Uuid::new_v4().to_string();
        let path = join(&self.dir(), &name);
        let mut reader = DigestReader::new(reader, digester);
        let size = match self.manager.fs.write(&path, &mut reader).await {
            Ok(size) => size,
            Err(e) => {
                remove_partial(&self.manager, &self.session.id, &path).await;
                return Err(e.into());
            }
        };
        let (_, digests) = reader.finish();
        let upload = Upload {
            name,
            size,
            digests,
        };

        let manager = Arc::clone(&self.manager);
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let result = record_upload(&manager, &session, &path, upload).await;
            drop(writing);
            result
        })
        .await
        .map_err(|e| UploadError::Internal(format!("upload task failed: {e}")))?
    }

    /// Delete the session's content and persisted record.
    ///
    /// Fails if another handle is open or the session is already being
    /// deleted. Waits for an in-flight write to finish first. The caller's
    /// own reference stays open; close it afterwards.
    ///
    /// Removal runs on its own task and completes even if the returned
    /// future is dropped.
    pub async fn delete(&self) -> UploadResult<()> {
        self.session.begin_delete()?;
        let removal = SessionHandle::new(Arc::clone(&self.manager), Arc::clone(&self.session));
        tokio::spawn(async move { removal.remove().await })
            .await
            .map_err(|e| UploadError::Internal(format!("delete task failed: {e}")))?
    }

    async fn remove(self) -> UploadResult<()> {
        let _writing = self.session.write_lock.lock().await;

        let mut reasons = Vec::new();
        let dir = self.dir();
        if let Err(e) = self.manager.fs.remove_all(&dir).await {
            reasons.push(format!("removing content at {dir}: {e}"));
        }
        if let Some(persist) = &self.manager.persist {
            if let Err(e) = persist.delete_session(&self.session.id).await {
                reasons.push(format!("deleting persisted record: {e}"));
            }
        }
        if !reasons.is_empty() {
            return Err(UploadError::DeleteFailed {
                id: self.session.id.clone(),
                reasons,
            });
        }
        info!(session_id = %self.session.id, "deleted upload session");
        Ok(())
    }

    /// Content source over this session's uploads, keyed by digests of
    /// `alg`. The source holds its own reference to the session.
    pub fn content_source(&self, alg: &str) -> UploadResult<SessionContent> {
        Ok(SessionContent {
            handle: self.try_clone()?,
            alg: alg.to_string(),
        })
    }

    /// Fixity source over this session's uploads: for a digest of `alg`,
    /// the upload's digests from every other algorithm.
    pub fn fixity_source(&self, alg: &str) -> UploadResult<SessionFixity> {
        Ok(SessionFixity {
            handle: self.try_clone()?,
            alg: alg.to_string(),
        })
    }

    /// Release this reference.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Table before session state, always.
        let mut table = self.manager.sessions();
        let mut state = self.session.state();
        state.refs = state.refs.saturating_sub(1);
        if state.deleting && state.refs == 0 {
            let installed = table
                .get(&self.session.id)
                .is_some_and(|s| Arc::ptr_eq(s, &self.session));
            if installed {
                table.remove(&self.session.id);
                debug!(session_id = %self.session.id, "removed deleted session");
            }
        }
    }
}

/// Persist `upload`, then list it in the session. Removes the stored file if
/// persisting fails.
async fn record_upload(
    manager: &ManagerInner,
    session: &Session,
    path: &str,
    upload: Upload,
) -> UploadResult<Upload> {
    if let Some(persist) = &manager.persist {
        if let Err(e) = persist.create_upload(&session.id, &upload).await {
            remove_partial(manager, &session.id, path).await;
            return Err(e.into());
        }
    }
    session.uploads_mut().push(upload.clone());
    debug!(session_id = %session.id, upload = %upload.name, size = upload.size, "stored upload");
    Ok(upload)
}

async fn remove_partial(manager: &ManagerInner, session_id: &str, path: &str) {
    if let Err(e) = manager.fs.remove_all(path).await {
        warn!(session_id, path, error = %e, "failed to remove partial upload");
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.session.id)
            .field("released", &self.released)
            .finish()
    }
}

/// [`ContentSource`] over a session's uploads.
#[derive(Debug)]
pub struct SessionContent {
    handle: SessionHandle,
    alg: String,
}

impl ContentSource for SessionContent {
    fn get_content(&self, digest: &str) -> Option<ContentRef> {
        let uploads = self.handle.session.uploads();
        let upload = uploads
            .iter()
            .find(|u| u.digests.get(&self.alg).is_some_and(|d| d == digest))?;
        Some(ContentRef {
            fs: Arc::clone(&self.handle.manager.fs),
            path: join(&self.handle.dir(), &upload.name),
        })
    }
}

/// [`FixitySource`] over a session's uploads.
#[derive(Debug)]
pub struct SessionFixity {
    handle: SessionHandle,
    alg: String,
}

impl FixitySource for SessionFixity {
    fn get_fixity(&self, digest: &str) -> DigestSet {
        let uploads = self.handle.session.uploads();
        let mut set = DigestSet::new();
        for upload in uploads
            .iter()
            .filter(|u| u.digests.get(&self.alg).is_some_and(|d| d == digest))
        {
            for (alg, value) in &upload.digests {
                if *alg != self.alg {
                    set.insert(alg.clone(), value.clone());
                }
            }
        }
        set
    }
}
