//! Reference versioned backend: one JSON inventory per object.
//!
//! Layout under the backend's root prefix:
//!
//! ```text
//! <root>/<h[0..3]>/<h[3..6]>/<h[6..9]>/<h>/   h = blake3(object id), hex
//!     inventory.json
//!     v1/content/<logical path>
//!     v2/content/<logical path>
//!     ...
//! ```
//!
//! Content is stored once per digest, under the first version that
//! introduced it.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use ark_digest::{DigestAlgorithm, DigestSet, MultiDigester};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{ObjectRef, VersionedBackend};
use crate::error::{StoreError, StoreResult};
use crate::fs::{join, WriteFs};
use crate::reader::DigestReader;
use crate::stage::{CommitOptions, ContentRef, DigestMap, Stage, User};

const INVENTORY_FILE: &str = "inventory.json";
const INVENTORY_TMP: &str = "inventory.json.tmp";

/// One version of an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub created: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub user: Option<User>,
    /// Digest to logical paths.
    pub state: DigestMap,
}

/// Everything known about an object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub id: String,
    pub digest_algorithm: DigestAlgorithm,
    pub head: u32,
    /// Digest to content paths, relative to the object's directory.
    pub manifest: DigestMap,
    /// Digest to fixity digests from other algorithms.
    #[serde(default)]
    pub fixity: BTreeMap<String, DigestSet>,
    pub versions: BTreeMap<u32, Version>,
}

impl Inventory {
    fn new(id: &str, digest_algorithm: DigestAlgorithm) -> Self {
        Self {
            id: id.to_string(),
            digest_algorithm,
            head: 0,
            manifest: DigestMap::new(),
            fixity: BTreeMap::new(),
            versions: BTreeMap::new(),
        }
    }

    pub fn version(&self, num: u32) -> Option<&Version> {
        self.versions.get(&num)
    }

    pub fn get_fixity(&self, digest: &str) -> DigestSet {
        self.fixity.get(digest).cloned().unwrap_or_default()
    }

    /// First content path for `digest`, relative to the object's directory.
    pub fn content_path(&self, digest: &str) -> Option<&str> {
        self.manifest
            .get(digest)
            .and_then(|paths| paths.first())
            .map(String::as_str)
    }
}

/// [`VersionedBackend`] storing each object as a directory with a JSON
/// inventory on any [`WriteFs`].
#[derive(Clone, Debug)]
pub struct InventoryBackend {
    fs: Arc<dyn WriteFs>,
    root: String,
}

impl InventoryBackend {
    /// Store objects under `root` (may be empty) on `fs`.
    pub fn new(fs: Arc<dyn WriteFs>, root: impl Into<String>) -> Self {
        Self {
            fs,
            root: root.into(),
        }
    }

    async fn load(&self, object_id: &str) -> StoreResult<Option<Inventory>> {
        let path = join(&self.resolve_id(object_id), INVENTORY_FILE);
        let bytes = match self.fs.read_all(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let inv: Inventory =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
        if inv.id != object_id {
            return Err(StoreError::Serialization(format!(
                "inventory at {path} belongs to {:?}, not {object_id:?}",
                inv.id
            )));
        }
        Ok(Some(inv))
    }

    /// Replace the object's inventory. The new inventory is written aside
    /// and renamed into place, so a crash leaves the old one intact.
    async fn save(&self, object_path: &str, inv: &Inventory) -> StoreResult<()> {
        let bytes =
            serde_json::to_vec_pretty(inv).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = join(object_path, INVENTORY_TMP);
        self.fs.write(&tmp, &mut &bytes[..]).await?;
        self.fs.rename(&tmp, &join(object_path, INVENTORY_FILE)).await?;
        Ok(())
    }

    /// Copy `src` to `dst`, checking that it hashes to `digest`.
    async fn copy_verified(
        &self,
        src: &ContentRef,
        dst: &str,
        alg: DigestAlgorithm,
        digest: &str,
    ) -> StoreResult<()> {
        let reader = src.fs.open_file(&src.path).await?;
        let mut reader = DigestReader::new(reader, MultiDigester::new(&[alg.as_str()])?);
        self.fs.write(dst, &mut reader).await?;
        let (_, digests) = reader.finish();
        let computed = digests.get(alg.as_str()).cloned().unwrap_or_default();
        if computed != digest {
            return Err(StoreError::DigestMismatch {
                path: src.path.clone(),
                expected: digest.to_string(),
                computed,
            });
        }
        Ok(())
    }

    async fn apply(
        &self,
        object_path: &str,
        inv: &mut Inventory,
        stage: &Stage,
        options: &CommitOptions,
    ) -> StoreResult<()> {
        let next = inv.head + 1;
        let mut state = stage.state.clone();
        for (digest, paths) in state.iter_mut() {
            paths.sort();
            if !inv.manifest.contains_key(digest) {
                let src = stage
                    .get_content(digest)
                    .ok_or_else(|| StoreError::MissingContent {
                        digest: digest.clone(),
                    })?;
                let content_path = format!("v{next}/content/{}", paths[0]);
                self.copy_verified(
                    &src,
                    &join(object_path, &content_path),
                    inv.digest_algorithm,
                    digest,
                )
                .await?;
                inv.manifest.insert(digest.clone(), vec![content_path]);
            }
            let fixity: DigestSet = stage
                .get_fixity(digest)
                .into_iter()
                .filter(|(alg, _)| alg != inv.digest_algorithm.as_str())
                .collect();
            if !fixity.is_empty() {
                let entry = inv.fixity.entry(digest.clone()).or_default();
                for (alg, value) in fixity {
                    entry.entry(alg).or_insert(value);
                }
            }
        }
        inv.versions.insert(
            next,
            Version {
                created: options.created.unwrap_or_else(Utc::now),
                message: options.message.clone(),
                user: options.user.clone(),
                state,
            },
        );
        inv.head = next;
        self.save(object_path, inv).await
    }
}

#[async_trait]
impl VersionedBackend for InventoryBackend {
    fn fs(&self) -> Arc<dyn WriteFs> {
        Arc::clone(&self.fs)
    }

    fn resolve_id(&self, object_id: &str) -> String {
        let hex = blake3::hash(object_id.as_bytes()).to_hex();
        let tuples = format!("{}/{}/{}/{}", &hex[0..3], &hex[3..6], &hex[6..9], hex);
        join(&self.root, &tuples)
    }

    async fn get_object(&self, object_id: &str) -> StoreResult<ObjectRef> {
        let inventory = self
            .load(object_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(object_id.to_string()))?;
        Ok(ObjectRef {
            id: object_id.to_string(),
            path: self.resolve_id(object_id),
            inventory,
        })
    }

    async fn commit(
        &self,
        object_id: &str,
        stage: &Stage,
        options: &CommitOptions,
    ) -> StoreResult<()> {
        stage.validate()?;
        let existing = self.load(object_id).await?;
        let is_new = existing.is_none();
        let mut inv = existing.unwrap_or_else(|| Inventory::new(object_id, stage.digest_algorithm));
        if inv.digest_algorithm != stage.digest_algorithm {
            return Err(StoreError::InvalidStage(format!(
                "object {object_id} uses {}, stage uses {}",
                inv.digest_algorithm, stage.digest_algorithm
            )));
        }
        let next = inv.head + 1;
        if let Some(expected) = options.head {
            if expected != next {
                return Err(StoreError::HeadConflict {
                    object_id: object_id.to_string(),
                    expected,
                    actual: next,
                });
            }
        }
        let object_path = self.resolve_id(object_id);
        if let Err(e) = self.apply(&object_path, &mut inv, stage, options).await {
            // Roll back whatever this version wrote.
            let partial = if is_new {
                object_path.clone()
            } else {
                join(&object_path, &format!("v{next}"))
            };
            if let Err(rm) = self.fs.remove_all(&partial).await {
                warn!(object_id, path = %partial, error = %rm, "failed to clean up after commit error");
            }
            return Err(e);
        }
        info!(object_id, version = next, "committed object version");
        debug!(object_id, digests = inv.manifest.len(), "manifest size");
        Ok(())
    }
}
