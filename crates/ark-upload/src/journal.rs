//! Crash-recoverable session journal.
//!
//! Every change to the session set is appended to a single file as one
//! framed entry:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized JournalEvent)]
//! ```
//!
//! Opening the journal replays it into an in-memory index. A torn entry at
//! the tail (a crash mid-append) ends replay and is cut off so later appends
//! stay reachable; entries failing their CRC are skipped.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PersistResult, PersistenceError};
use crate::persistence::Persistence;
use crate::types::{SessionRecord, Upload};

const HEADER_SIZE: usize = 8;

/// One journaled change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum JournalEvent {
    SessionCreated(SessionRecord),
    UploadCreated { session_id: String, upload: Upload },
    SessionDeleted { session_id: String },
}

/// When appended entries are forced to disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every append.
    #[default]
    EveryWrite,
    /// Flush to the OS and let it decide.
    OsDefault,
}

struct JournalState {
    file: File,
    offset: u64,
    // Bytes past `offset` may be on disk from a failed append.
    dirty: bool,
    sessions: HashMap<String, SessionRecord>,
}

struct JournalInner {
    path: PathBuf,
    sync: SyncMode,
    state: Mutex<JournalState>,
}

/// [`Persistence`] backed by an append-only journal file.
///
/// Reads are served from the replayed index; appends run on the blocking
/// thread pool.
#[derive(Clone)]
pub struct JournalPersistence {
    inner: Arc<JournalInner>,
}

impl JournalPersistence {
    /// Open (or create) the journal at `path`, fsyncing every append.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        Self::open_with(path, SyncMode::default())
    }

    pub fn open_with(path: impl AsRef<Path>, sync: SyncMode) -> PersistResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let (events, valid_len) = replay(&bytes);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        if valid_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = bytes.len(),
                "discarding torn journal tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        let mut sessions = HashMap::new();
        for event in events {
            apply(&mut sessions, event);
        }
        info!(path = %path.display(), sessions = sessions.len(), "opened session journal");
        Ok(Self {
            inner: Arc::new(JournalInner {
                path: path.to_path_buf(),
                sync,
                state: Mutex::new(JournalState {
                    file,
                    offset: valid_len,
                    dirty: false,
                    sessions,
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current length of the journal file in bytes.
    pub fn offset(&self) -> u64 {
        self.inner.state().offset
    }

    /// Rewrite the journal with one entry per live session, dropping the
    /// history of deleted sessions. Returns the new length in bytes.
    pub async fn compact(&self) -> PersistResult<u64> {
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.compact()).await
    }

    async fn append(&self, event: JournalEvent) -> PersistResult<()> {
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.append(event)).await
    }
}

impl JournalInner {
    // Appends and index updates happen under one lock, so the index never
    // runs ahead of the file.
    fn state(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write one event and apply it to the index. A failed append leaves
    /// neither the index nor the file changed: whatever part of the frame
    /// reached the file is cut off before anything else is written.
    fn append(&self, event: JournalEvent) -> PersistResult<()> {
        let mut state = self.state();
        if state.dirty {
            state.file.set_len(state.offset)?;
            state.dirty = false;
        }
        check(&state.sessions, &event)?;
        let frame = encode(&event)?;
        if let Err(e) = self.write_frame(&mut state.file, &frame) {
            match state.file.set_len(state.offset) {
                Ok(()) => warn!(offset = state.offset, error = %e, "journal append failed; rolled back"),
                Err(undo) => {
                    warn!(
                        offset = state.offset,
                        error = %e,
                        truncate_error = %undo,
                        "journal append failed; rollback pending"
                    );
                    state.dirty = true;
                }
            }
            return Err(e.into());
        }
        state.offset += frame.len() as u64;
        debug!(offset = state.offset, len = frame.len(), "journal append");
        apply(&mut state.sessions, event);
        Ok(())
    }

    fn write_frame(&self, file: &mut File, frame: &[u8]) -> std::io::Result<()> {
        file.write_all(frame)?;
        if self.sync == SyncMode::EveryWrite {
            file.sync_data()?;
        }
        Ok(())
    }

    fn compact(&self) -> PersistResult<u64> {
        let mut state = self.state();
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = BufWriter::new(File::create(&tmp_path)?);
        let mut ids: Vec<&String> = state.sessions.keys().collect();
        ids.sort();
        let mut len = 0u64;
        for id in ids {
            let frame = encode(&JournalEvent::SessionCreated(state.sessions[id].clone()))?;
            tmp.write_all(&frame)?;
            len += frame.len() as u64;
        }
        tmp.flush()?;
        tmp.get_ref().sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        state.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        state.dirty = false;
        let before = state.offset;
        state.offset = len;
        info!(before, after = len, sessions = state.sessions.len(), "compacted session journal");
        Ok(len)
    }
}

async fn blocking<T, F>(f: F) -> PersistResult<T>
where
    F: FnOnce() -> PersistResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Internal(format!("journal task failed: {e}")))?
}

fn encode(event: &JournalEvent) -> PersistResult<Vec<u8>> {
    let payload =
        bincode::serialize(event).map_err(|e| PersistenceError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode every intact entry. Also returns the length of the well-framed
/// prefix of `bytes`.
fn replay(bytes: &[u8]) -> (Vec<JournalEvent>, u64) {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset + HEADER_SIZE <= bytes.len() {
        let header = &bytes[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let end = offset + HEADER_SIZE + length;
        if length == 0 || end > bytes.len() {
            warn!(offset, length, "invalid journal entry length; stopping replay");
            break;
        }
        let payload = &bytes[offset + HEADER_SIZE..end];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(offset, expected = expected_crc, actual = actual_crc, "CRC mismatch; skipping entry");
        } else {
            match bincode::deserialize::<JournalEvent>(payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!(offset, error = %e, "undecodable journal entry; skipping"),
            }
        }
        offset = end;
    }
    (events, offset as u64)
}

fn check(sessions: &HashMap<String, SessionRecord>, event: &JournalEvent) -> PersistResult<()> {
    match event {
        JournalEvent::SessionCreated(record) if sessions.contains_key(&record.id) => {
            Err(PersistenceError::AlreadyExists(record.id.clone()))
        }
        JournalEvent::UploadCreated { session_id, .. } if !sessions.contains_key(session_id) => {
            Err(PersistenceError::NotFound(session_id.clone()))
        }
        _ => Ok(()),
    }
}

fn apply(sessions: &mut HashMap<String, SessionRecord>, event: JournalEvent) {
    match event {
        JournalEvent::SessionCreated(record) => {
            sessions.insert(record.id.clone(), record);
        }
        JournalEvent::UploadCreated { session_id, upload } => {
            if let Some(record) = sessions.get_mut(&session_id) {
                record.uploads.push(upload);
            }
        }
        JournalEvent::SessionDeleted { session_id } => {
            sessions.remove(&session_id);
        }
    }
}

#[async_trait]
impl Persistence for JournalPersistence {
    async fn create_session(&self, record: &SessionRecord) -> PersistResult<()> {
        self.append(JournalEvent::SessionCreated(record.clone())).await
    }

    async fn create_upload(&self, session_id: &str, upload: &Upload) -> PersistResult<()> {
        self.append(JournalEvent::UploadCreated {
            session_id: session_id.to_string(),
            upload: upload.clone(),
        })
        .await
    }

    async fn session_ids(&self) -> PersistResult<Vec<String>> {
        let mut ids: Vec<String> = self.inner.state().sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_session(&self, id: &str) -> PersistResult<SessionRecord> {
        self.inner
            .state()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    async fn delete_session(&self, id: &str) -> PersistResult<()> {
        if !self.inner.state().sessions.contains_key(id) {
            return Ok(());
        }
        self.append(JournalEvent::SessionDeleted {
            session_id: id.to_string(),
        })
        .await
    }

    async fn count_sessions(&self) -> PersistResult<usize> {
        Ok(self.inner.state().sessions.len())
    }
}

impl std::fmt::Debug for JournalPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalPersistence")
            .field("path", &self.inner.path)
            .field("sync", &self.inner.sync)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionConfig;
    use chrono::{TimeZone, Utc};
    use std::io::{Read, Seek, SeekFrom};

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            config: SessionConfig {
                user_id: "tester".into(),
                digest_algorithms: vec!["sha256".into(), "md5".into()],
                description: format!("session {id}"),
            },
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            uploads: Vec::new(),
        }
    }

    fn upload(name: &str) -> Upload {
        Upload {
            name: name.into(),
            size: 12,
            digests: [
                ("sha256".to_string(), "ab".repeat(32)),
                ("md5".to_string(), "cd".repeat(16)),
            ]
            .into(),
        }
    }

    #[tokio::test]
    async fn reopen_restores_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.journal");
        {
            let j = JournalPersistence::open(&path).unwrap();
            j.create_session(&record("s1")).await.unwrap();
            j.create_session(&record("s2")).await.unwrap();
            j.create_upload("s1", &upload("u1")).await.unwrap();
            j.create_upload("s1", &upload("u2")).await.unwrap();
            j.delete_session("s2").await.unwrap();
        }

        let j = JournalPersistence::open(&path).unwrap();
        assert_eq!(j.session_ids().await.unwrap(), vec!["s1"]);
        let s1 = j.get_session("s1").await.unwrap();
        assert_eq!(s1.config, record("s1").config);
        assert_eq!(s1.created_at, record("s1").created_at);
        assert_eq!(s1.uploads, vec![upload("u1"), upload("u2")]);
    }

    #[tokio::test]
    async fn rejects_inconsistent_events() {
        let dir = tempfile::tempdir().unwrap();
        let j = JournalPersistence::open(dir.path().join("j")).unwrap();
        j.create_session(&record("s1")).await.unwrap();
        let before = j.offset();
        assert!(matches!(
            j.create_session(&record("s1")).await,
            Err(PersistenceError::AlreadyExists(_))
        ));
        assert!(matches!(
            j.create_upload("missing", &upload("u")).await,
            Err(PersistenceError::NotFound(_))
        ));
        j.delete_session("missing").await.unwrap();
        assert_eq!(j.offset(), before);
    }

    #[tokio::test]
    async fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        {
            let j = JournalPersistence::open(&path).unwrap();
            j.create_session(&record("s1")).await.unwrap();
            j.create_upload("s1", &upload("u1")).await.unwrap();
        }
        // A crash partway through the next append.
        let full_len = fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&500u32.to_le_bytes()).unwrap();
            file.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        }

        let j = JournalPersistence::open(&path).unwrap();
        assert_eq!(j.offset(), full_len);
        assert_eq!(j.get_session("s1").await.unwrap().uploads.len(), 1);

        // Appends after recovery are readable on the next open.
        j.create_upload("s1", &upload("u2")).await.unwrap();
        drop(j);
        let j = JournalPersistence::open(&path).unwrap();
        assert_eq!(j.get_session("s1").await.unwrap().uploads.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        {
            let j = JournalPersistence::open(&path).unwrap();
            j.create_session(&record("s1")).await.unwrap();
            j.create_session(&record("s2")).await.unwrap();
        }
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            let mut buf = [0u8; 1];
            file.read_exact(&mut buf).unwrap();
            buf[0] ^= 0xFF;
            file.seek(SeekFrom::Start(HEADER_SIZE as u64)).unwrap();
            file.write_all(&buf).unwrap();
            file.sync_all().unwrap();
        }

        let j = JournalPersistence::open(&path).unwrap();
        assert_eq!(j.session_ids().await.unwrap(), vec!["s2"]);
    }

    #[tokio::test]
    async fn compact_keeps_live_sessions_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        let j = JournalPersistence::open_with(&path, SyncMode::OsDefault).unwrap();
        for i in 0..10 {
            let id = format!("s{i}");
            j.create_session(&record(&id)).await.unwrap();
            j.create_upload(&id, &upload("u")).await.unwrap();
        }
        for i in 1..10 {
            j.delete_session(&format!("s{i}")).await.unwrap();
        }
        let before = j.offset();
        let after = j.compact().await.unwrap();
        assert!(after < before);
        assert_eq!(fs::metadata(&path).unwrap().len(), after);

        j.create_upload("s0", &upload("u2")).await.unwrap();
        drop(j);
        let j = JournalPersistence::open(&path).unwrap();
        assert_eq!(j.count_sessions().await.unwrap(), 1);
        assert_eq!(
            j.get_session("s0").await.unwrap().uploads,
            vec![upload("u"), upload("u2")]
        );
    }

    #[tokio::test]
    async fn failed_append_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j");
        let j = JournalPersistence::open(&path).unwrap();
        j.create_session(&record("s1")).await.unwrap();
        let before = j.offset();

        // A write error after part of a frame reached the disk.
        {
            let mut partial = OpenOptions::new().append(true).open(&path).unwrap();
            partial.write_all(&[7u8; 11]).unwrap();
            let mut state = j.inner.state();
            state.file = File::open(&path).unwrap();
        }
        assert!(matches!(
            j.create_upload("s1", &upload("lost")).await,
            Err(PersistenceError::Io(_))
        ));
        assert_eq!(j.offset(), before);
        assert!(j.get_session("s1").await.unwrap().uploads.is_empty());

        j.inner.state().file = OpenOptions::new().read(true).append(true).open(&path).unwrap();
        j.create_upload("s1", &upload("kept")).await.unwrap();
        drop(j);

        let j = JournalPersistence::open(&path).unwrap();
        assert_eq!(j.get_session("s1").await.unwrap().uploads, vec![upload("kept")]);
        assert_eq!(fs::metadata(&path).unwrap().len(), j.offset());
    }

    #[test]
    fn replay_of_empty_input() {
        let (events, len) = replay(&[]);
        assert!(events.is_empty());
        assert_eq!(len, 0);
    }
}
