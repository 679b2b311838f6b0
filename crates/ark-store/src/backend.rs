use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::fs::WriteFs;
use crate::inventory::Inventory;
use crate::stage::{CommitOptions, Stage};

/// A resolved object: its id, its path on the backing filesystem, and its
/// current inventory.
#[derive(Clone, Debug)]
pub struct ObjectRef {
    pub id: String,
    pub path: String,
    pub inventory: Inventory,
}

/// Versioned-object semantics over a backing filesystem.
///
/// A backend does no locking of its own; [`crate::StorageRoot`] serializes
/// mutations per object id before calling into it.
#[async_trait]
pub trait VersionedBackend: Send + Sync {
    /// The filesystem objects are stored on.
    fn fs(&self) -> Arc<dyn WriteFs>;

    /// Path of the object's directory on [`VersionedBackend::fs`]. The object
    /// need not exist.
    fn resolve_id(&self, object_id: &str) -> String;

    /// Load the object. Fails with [`crate::StoreError::NotFound`] if it
    /// doesn't exist.
    async fn get_object(&self, object_id: &str) -> StoreResult<ObjectRef>;

    /// Create the object, or add a version to it, from `stage`.
    async fn commit(
        &self,
        object_id: &str,
        stage: &Stage,
        options: &CommitOptions,
    ) -> StoreResult<()>;
}
