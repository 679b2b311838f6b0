use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ark_lock::KeyedLock;
use ark_store::{InventoryBackend, LocalFs, StorageRoot, WriteFs};
use ark_upload::{JournalPersistence, Persistence, UploadManager};
use tracing::info;

use crate::auth::{AllowAllAuth, AuthProvider};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Directory under the server root holding objects.
pub const OBJECTS_DIR: &str = "objects";

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Storage roots by id.
    pub roots: Arc<BTreeMap<String, StorageRoot>>,
    pub uploads: Option<UploadManager>,
    pub auth: Arc<dyn AuthProvider>,
}

/// Open a local storage root with its own lock table.
fn open_root(
    id: &str,
    dir: &Path,
    lock_capacity: usize,
) -> ServerResult<(StorageRoot, Arc<dyn WriteFs>)> {
    std::fs::create_dir_all(dir)?;
    let fs: Arc<dyn WriteFs> = Arc::new(LocalFs::new(dir));
    let backend = Arc::new(InventoryBackend::new(Arc::clone(&fs), OBJECTS_DIR));
    let root = StorageRoot::with_locks(id, backend, KeyedLock::new(lock_capacity));
    info!(storage_root = id, dir = %dir.display(), "storage root ready");
    Ok((root, fs))
}

impl AppState {
    /// Open every storage root, and the upload manager if uploads are
    /// enabled.
    pub fn from_config(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let mut roots = BTreeMap::new();
        let (primary, fs) =
            open_root(&config.storage_root_id, &config.root, config.lock_capacity)?;
        roots.insert(config.storage_root_id.clone(), primary);
        for extra in &config.roots {
            let (root, _) = open_root(&extra.id, &extra.path, config.lock_capacity)?;
            roots.insert(extra.id.clone(), root);
        }

        let uploads = match &config.uploads_dir {
            Some(dir) => {
                let persist: Option<Arc<dyn Persistence>> = match &config.journal_path {
                    Some(path) => {
                        let journal: Arc<dyn Persistence> =
                            Arc::new(JournalPersistence::open(path).map_err(|e| {
                                ServerError::Config(format!("opening {}: {e}", path.display()))
                            })?);
                        Some(journal)
                    }
                    None => None,
                };
                Some(UploadManager::new(Arc::clone(&fs), dir.clone(), persist))
            }
            None => None,
        };
        info!(roots = roots.len(), uploads = uploads.is_some(), "storage ready");
        Ok(Self {
            config: Arc::new(config),
            roots: Arc::new(roots),
            uploads,
            auth: Arc::new(AllowAllAuth),
        })
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn root(&self, id: &str) -> ServerResult<&StorageRoot> {
        self.roots
            .get(id)
            .ok_or_else(|| ServerError::NotFound(format!("storage root {id}")))
    }

    pub fn uploads(&self) -> ServerResult<&UploadManager> {
        self.uploads
            .as_ref()
            .ok_or_else(|| ServerError::InvalidArgument("the server does not support uploads".into()))
    }
}
