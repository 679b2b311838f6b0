//! The storage root: lease discipline around a [`VersionedBackend`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ark_digest::{DigestAlgorithm, DigestSet};
use ark_lock::{KeyedLock, LockGuard};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::backend::VersionedBackend;
use crate::error::{StoreError, StoreResult};
use crate::fs::{join, BoxReader, WriteFs};
use crate::inventory::Inventory;
use crate::stage::{CommitOptions, ContentRef, ContentSource, FileInfo, FixitySource, Stage, User};

/// A named storage root. Cloning yields another handle to the same backend
/// and lock table.
#[derive(Clone)]
pub struct StorageRoot {
    id: String,
    backend: Arc<dyn VersionedBackend>,
    locks: KeyedLock,
}

impl StorageRoot {
    pub fn new(id: impl Into<String>, backend: Arc<dyn VersionedBackend>) -> Self {
        Self::with_locks(id, backend, KeyedLock::default())
    }

    /// Use an explicit lock table, e.g. one with a non-default capacity.
    pub fn with_locks(
        id: impl Into<String>,
        backend: Arc<dyn VersionedBackend>,
        locks: KeyedLock,
    ) -> Self {
        Self {
            id: id.into(),
            backend,
            locks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> &Arc<dyn VersionedBackend> {
        &self.backend
    }

    pub fn locks(&self) -> &KeyedLock {
        &self.locks
    }

    /// Open a read handle on one version of an object. Version 0 means the
    /// head version.
    ///
    /// The returned handle holds a shared lease on the object until it is
    /// closed or dropped; commits and deletes of the object fail meanwhile.
    pub async fn get_object_version(
        &self,
        object_id: &str,
        version: u32,
    ) -> StoreResult<ObjectVersion> {
        let lease = self.locks.acquire_read(object_id)?;
        let obj = self.backend.get_object(object_id).await?;
        let inv = obj.inventory;
        let num = if version == 0 { inv.head } else { version };
        let ver = inv
            .version(num)
            .ok_or_else(|| StoreError::VersionNotFound {
                object_id: object_id.to_string(),
                version: num,
            })?;

        let mut state = BTreeMap::new();
        let mut content = BTreeMap::new();
        for (digest, paths) in &ver.state {
            state.insert(
                digest.clone(),
                FileInfo {
                    paths: paths.clone(),
                    fixity: inv.get_fixity(digest),
                },
            );
            if let Some(path) = inv.content_path(digest) {
                content.insert(digest.clone(), join(&obj.path, path));
            }
        }
        debug!(object_id, version = num, "opened object version");
        Ok(ObjectVersion {
            object_id: object_id.to_string(),
            storage_root_id: self.id.clone(),
            digest_algorithm: inv.digest_algorithm,
            head: inv.head,
            version: num,
            state,
            message: ver.message.clone(),
            user: ver.user.clone(),
            created: ver.created,
            content,
            fs: self.backend.fs(),
            lease,
        })
    }

    /// Open a read handle on an object's manifest: every digest in any
    /// version with its content paths.
    pub async fn get_object_manifest(&self, object_id: &str) -> StoreResult<ObjectManifest> {
        let lease = self.locks.acquire_read(object_id)?;
        let obj = self.backend.get_object(object_id).await?;
        let Inventory {
            digest_algorithm,
            head,
            manifest,
            fixity,
            ..
        } = obj.inventory;
        let mut files = BTreeMap::new();
        for (digest, paths) in manifest {
            let fixity = fixity.get(&digest).cloned().unwrap_or_default();
            files.insert(digest, FileInfo { paths, fixity });
        }
        Ok(ObjectManifest {
            object_id: object_id.to_string(),
            storage_root_id: self.id.clone(),
            path: obj.path,
            digest_algorithm,
            head,
            manifest: files,
            fs: self.backend.fs(),
            lease,
        })
    }

    /// Commit `stage` as the next version of the object.
    ///
    /// Once the exclusive lease is held the commit runs on its own task, so
    /// dropping the returned future does not abort it. The lease is released
    /// when that task finishes, whatever the outcome.
    pub async fn commit(
        &self,
        object_id: &str,
        stage: Stage,
        options: CommitOptions,
    ) -> StoreResult<()> {
        let lease = self.locks.acquire_write(object_id)?;
        let backend = Arc::clone(&self.backend);
        let id = object_id.to_string();
        let task = tokio::spawn(async move {
            let result = backend.commit(&id, &stage, &options).await;
            // Content sources may pin other resources; let them go first.
            drop(stage);
            lease.release();
            result
        });
        task.await
            .map_err(|e| StoreError::Internal(format!("commit task failed: {e}")))?
    }

    /// Remove the object and all of its versions. Runs detached like
    /// [`StorageRoot::commit`].
    pub async fn delete_object(&self, object_id: &str) -> StoreResult<()> {
        let lease = self.locks.acquire_write(object_id)?;
        let backend = Arc::clone(&self.backend);
        let id = object_id.to_string();
        let task = tokio::spawn(async move {
            let result = async {
                let obj = backend.get_object(&id).await?;
                backend.fs().remove_all(&obj.path).await?;
                info!(object_id = %id, "deleted object");
                Ok(())
            }
            .await;
            lease.release();
            result
        });
        task.await
            .map_err(|e| StoreError::Internal(format!("delete task failed: {e}")))?
    }
}

impl fmt::Debug for StorageRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRoot")
            .field("id", &self.id)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

/// Read handle on one version of an object.
pub struct ObjectVersion {
    pub object_id: String,
    pub storage_root_id: String,
    pub digest_algorithm: DigestAlgorithm,
    pub head: u32,
    pub version: u32,
    /// Digest to logical paths and fixity.
    pub state: BTreeMap<String, FileInfo>,
    pub message: String,
    pub user: Option<User>,
    pub created: DateTime<Utc>,
    content: BTreeMap<String, String>,
    fs: Arc<dyn WriteFs>,
    lease: LockGuard,
}

impl ObjectVersion {
    /// Logical path to digest.
    pub fn path_map(&self) -> BTreeMap<String, String> {
        self.state
            .iter()
            .flat_map(|(digest, info)| info.paths.iter().map(move |p| (p.clone(), digest.clone())))
            .collect()
    }

    pub fn digest_for(&self, logical_path: &str) -> Option<&str> {
        self.state
            .iter()
            .find(|(_, info)| info.paths.iter().any(|p| p == logical_path))
            .map(|(digest, _)| digest.as_str())
    }

    /// Open the file at `logical_path` for reading. The reader does not
    /// extend the lease; keep the handle open until reading is done.
    pub async fn open_file(&self, logical_path: &str) -> StoreResult<BoxReader> {
        let content = self
            .digest_for(logical_path)
            .and_then(|digest| self.content.get(digest))
            .ok_or_else(|| StoreError::FileNotFound {
                object_id: self.object_id.clone(),
                path: logical_path.to_string(),
            })?;
        Ok(self.fs.open_file(content).await?)
    }

    /// Release the read lease.
    pub fn close(self) {
        self.lease.release();
    }
}

impl fmt::Debug for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectVersion")
            .field("object_id", &self.object_id)
            .field("version", &self.version)
            .field("head", &self.head)
            .field("files", &self.state.len())
            .finish_non_exhaustive()
    }
}

/// Read handle on an object's manifest. Doubles as a content and fixity
/// source for commits that reuse the object's content.
pub struct ObjectManifest {
    pub object_id: String,
    pub storage_root_id: String,
    /// The object's directory on the backing filesystem.
    pub path: String,
    pub digest_algorithm: DigestAlgorithm,
    pub head: u32,
    /// Digest to content paths (relative to `path`) and fixity.
    pub manifest: BTreeMap<String, FileInfo>,
    fs: Arc<dyn WriteFs>,
    lease: LockGuard,
}

impl ObjectManifest {
    pub fn close(self) {
        self.lease.release();
    }
}

impl ContentSource for ObjectManifest {
    fn get_content(&self, digest: &str) -> Option<ContentRef> {
        let info = self.manifest.get(digest)?;
        let path = info.paths.first()?;
        Some(ContentRef {
            fs: Arc::clone(&self.fs),
            path: join(&self.path, path),
        })
    }
}

impl FixitySource for ObjectManifest {
    fn get_fixity(&self, digest: &str) -> DigestSet {
        self.manifest
            .get(digest)
            .map(|info| info.fixity.clone())
            .unwrap_or_default()
    }
}

impl fmt::Debug for ObjectManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectManifest")
            .field("object_id", &self.object_id)
            .field("head", &self.head)
            .field("digests", &self.manifest.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::inventory::InventoryBackend;
    use ark_digest::digest_hex;
    use ark_lock::LockError;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Serves staged bytes by digest from `staging/<digest>`.
    struct Staging(Arc<dyn WriteFs>);

    impl ContentSource for Staging {
        fn get_content(&self, digest: &str) -> Option<ContentRef> {
            Some(ContentRef {
                fs: Arc::clone(&self.0),
                path: format!("staging/{digest}"),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        fs: Arc<dyn WriteFs>,
        root: StorageRoot,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn WriteFs> = Arc::new(LocalFs::new(dir.path()));
        let backend = Arc::new(InventoryBackend::new(Arc::clone(&fs), "root"));
        Fixture {
            _dir: dir,
            root: StorageRoot::new("test", backend),
            fs,
        }
    }

    impl Fixture {
        async fn stage(&self, files: &[(&str, &str)]) -> Stage {
            let mut paths = BTreeMap::new();
            for (name, body) in files {
                let digest = digest_hex(DigestAlgorithm::Sha256, body.as_bytes());
                self.fs
                    .write(&format!("staging/{digest}"), &mut body.as_bytes())
                    .await
                    .unwrap();
                paths.insert(name.to_string(), digest);
            }
            Stage::from_path_map(DigestAlgorithm::Sha256, &paths)
                .unwrap()
                .with_content(Arc::new(Staging(Arc::clone(&self.fs))))
        }
    }

    #[tokio::test]
    async fn commit_then_read() {
        let fx = fixture();
        let stage = fx.stage(&[("hello.txt", "hello"), ("a/b.txt", "b")]).await;
        fx.root
            .commit("obj", stage, CommitOptions::new("first"))
            .await
            .unwrap();
        assert!(fx.root.locks().is_empty());

        let ver = fx.root.get_object_version("obj", 0).await.unwrap();
        assert_eq!(ver.version, 1);
        assert_eq!(ver.head, 1);
        assert_eq!(ver.message, "first");
        assert_eq!(ver.storage_root_id, "test");
        assert_eq!(ver.path_map().len(), 2);

        let mut body = String::new();
        ver.open_file("hello.txt")
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        assert_eq!(body, "hello");
        assert!(matches!(
            ver.open_file("nope.txt").await.err().unwrap(),
            StoreError::FileNotFound { .. }
        ));

        assert_eq!(fx.root.locks().state("obj").unwrap().refs, 1);
        ver.close();
        assert!(fx.root.locks().is_empty());
    }

    #[tokio::test]
    async fn failed_read_releases_lease() {
        let fx = fixture();
        let err = fx.root.get_object_version("missing", 0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(err.as_lock_error().is_none());
        assert!(fx.root.locks().is_empty());

        let stage = fx.stage(&[("a", "a")]).await;
        fx.root
            .commit("obj", stage, CommitOptions::new("m"))
            .await
            .unwrap();
        let err = fx.root.get_object_version("obj", 7).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionNotFound { version: 7, .. }));
        assert!(fx.root.locks().is_empty());
    }

    #[tokio::test]
    async fn open_reader_blocks_commit_and_delete() {
        let fx = fixture();
        let stage = fx.stage(&[("a", "a")]).await;
        fx.root
            .commit("obj", stage, CommitOptions::new("m"))
            .await
            .unwrap();

        let ver = fx.root.get_object_version("obj", 1).await.unwrap();
        let stage = fx.stage(&[("b", "b")]).await;
        let err = fx
            .root
            .commit("obj", stage, CommitOptions::new("m2"))
            .await
            .unwrap_err();
        assert_eq!(err.as_lock_error(), Some(LockError::WriteLock));
        let err = fx.root.delete_object("obj").await.unwrap_err();
        assert_eq!(err.as_lock_error(), Some(LockError::WriteLock));

        // Readers still share.
        let again = fx.root.get_object_version("obj", 1).await.unwrap();
        assert_eq!(fx.root.locks().state("obj").unwrap().refs, 2);
        drop(again);
        ver.close();
        fx.root.delete_object("obj").await.unwrap();
    }

    /// Holds every `open_file` until the test adds permits.
    #[derive(Debug)]
    struct GatedFs {
        inner: Arc<dyn WriteFs>,
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait::async_trait]
    impl WriteFs for GatedFs {
        async fn write(
            &self,
            path: &str,
            reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
        ) -> std::io::Result<u64> {
            self.inner.write(path, reader).await
        }
        async fn open_file(&self, path: &str) -> std::io::Result<crate::fs::BoxReader> {
            self.gate
                .acquire()
                .await
                .map_err(std::io::Error::other)?
                .forget();
            self.inner.open_file(path).await
        }
        async fn remove_all(&self, path: &str) -> std::io::Result<()> {
            self.inner.remove_all(path).await
        }
        async fn rename(&self, from: &str, to: &str) -> std::io::Result<()> {
            self.inner.rename(from, to).await
        }
        async fn read_dir(&self, path: &str) -> std::io::Result<Vec<crate::fs::DirEntry>> {
            self.inner.read_dir(path).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_one_wins() {
        let fx = fixture();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let gated: Arc<dyn WriteFs> = Arc::new(GatedFs {
            inner: Arc::clone(&fx.fs),
            gate: Arc::clone(&gate),
        });
        let staged = |name: &'static str| {
            let paths = BTreeMap::from([(
                format!("{name}.txt"),
                digest_hex(DigestAlgorithm::Sha256, name.as_bytes()),
            )]);
            Stage::from_path_map(DigestAlgorithm::Sha256, &paths)
                .unwrap()
                .with_content(Arc::new(Staging(Arc::clone(&gated))))
        };
        for name in ["one", "two"] {
            let digest = digest_hex(DigestAlgorithm::Sha256, name.as_bytes());
            fx.fs
                .write(&format!("staging/{digest}"), &mut name.as_bytes())
                .await
                .unwrap();
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let spawn_commit = |name: &'static str| {
            let root = fx.root.clone();
            let barrier = Arc::clone(&barrier);
            let stage = staged(name);
            tokio::spawn(async move {
                barrier.wait().await;
                root.commit("obj", stage, CommitOptions::new(name)).await
            })
        };
        let mut one = spawn_commit("one");
        let mut two = spawn_commit("two");

        // The winner is parked on the gate, so the first to finish lost.
        let (lost, one_lost) = tokio::select! {
            r = &mut one => (r.unwrap(), true),
            r = &mut two => (r.unwrap(), false),
        };
        let winner = if one_lost { two } else { one };
        assert_eq!(lost.unwrap_err().as_lock_error(), Some(LockError::WriteLock));
        gate.add_permits(16);
        winner.await.unwrap().unwrap();

        let ver = fx.root.get_object_version("obj", 0).await.unwrap();
        assert_eq!(ver.head, 1);
        let (won, lost) = if ver.message == "one" {
            ("one.txt", "two.txt")
        } else {
            ("two.txt", "one.txt")
        };
        assert!(ver.digest_for(won).is_some());
        assert!(ver.digest_for(lost).is_none());
        assert_eq!(ver.path_map().len(), 1);
    }

    #[tokio::test]
    async fn commit_survives_dropped_caller() {
        let fx = fixture();
        let stage = fx.stage(&[("a.txt", "survivor")]).await;
        let commit = fx.root.commit("obj", stage, CommitOptions::new("m"));
        let _ = tokio::time::timeout(Duration::ZERO, commit).await;

        for _ in 0..500 {
            if fx.root.locks().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.root.locks().is_empty());
        let ver = fx.root.get_object_version("obj", 0).await.unwrap();
        assert_eq!(ver.head, 1);
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let fx = fixture();
        let stage = fx.stage(&[("a", "a")]).await;
        fx.root
            .commit("obj", stage, CommitOptions::new("m"))
            .await
            .unwrap();
        fx.root.delete_object("obj").await.unwrap();
        assert!(fx.root.locks().is_empty());
        assert!(fx
            .root
            .get_object_version("obj", 0)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(fx.root.delete_object("obj").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn manifest_as_content_source() {
        let fx = fixture();
        let stage = fx.stage(&[("data.bin", "shared bytes")]).await;
        fx.root
            .commit("src", stage, CommitOptions::new("m"))
            .await
            .unwrap();
        fx.fs.remove_all("staging").await.unwrap();

        let manifest = Arc::new(fx.root.get_object_manifest("src").await.unwrap());
        assert_eq!(manifest.head, 1);
        let digest = digest_hex(DigestAlgorithm::Sha256, b"shared bytes");
        let mut paths = BTreeMap::new();
        paths.insert("copy.bin".to_string(), digest.clone());
        let mut stage = Stage::from_path_map(DigestAlgorithm::Sha256, &paths).unwrap();
        stage.overlay(
            Some(Arc::clone(&manifest) as Arc<dyn ContentSource>),
            Some(Arc::clone(&manifest) as Arc<dyn FixitySource>),
        );
        fx.root
            .commit("dst", stage, CommitOptions::new("copied"))
            .await
            .unwrap();
        drop(manifest);
        assert!(fx.root.locks().is_empty());

        let ver = fx.root.get_object_version("dst", 0).await.unwrap();
        assert_eq!(ver.digest_for("copy.bin"), Some(digest.as_str()));
    }
}
