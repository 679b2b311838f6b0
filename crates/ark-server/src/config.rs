use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// A further storage root served next to the primary one. It has its own
/// directory and lock table; upload sessions always live in the primary
/// root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootConfig {
    pub id: String,
    pub path: PathBuf,
}

/// Server settings, loadable from TOML. Missing keys take their defaults.
///
/// ```toml
/// storage_root_id = "main"
/// root = "/srv/ark"
///
/// [[roots]]
/// id = "archive"
/// path = "/mnt/archive"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Id of the primary storage root.
    pub storage_root_id: String,
    /// Local directory of the primary root, holding its objects and upload
    /// content.
    pub root: PathBuf,
    /// Directory under `root` for upload sessions. Uploads are disabled when
    /// unset.
    pub uploads_dir: Option<String>,
    /// Session journal. Without one, sessions don't survive a restart.
    pub journal_path: Option<PathBuf>,
    /// Maximum number of objects with open leases.
    pub lock_capacity: usize,
    /// Largest accepted upload body, in bytes.
    pub max_upload_size: u64,
    pub allow_anonymous: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roots: Vec<RootConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8283)),
            storage_root_id: "default".into(),
            root: PathBuf::from("."),
            uploads_dir: Some("uploads".into()),
            journal_path: None,
            lock_capacity: ark_lock::DEFAULT_CAPACITY,
            max_upload_size: 1024 * 1024 * 1024,
            allow_anonymous: true,
            roots: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.storage_root_id.is_empty() {
            return Err(ServerError::Config("storage_root_id must not be empty".into()));
        }
        if self.lock_capacity == 0 {
            return Err(ServerError::Config("lock_capacity must be at least 1".into()));
        }
        if let Some(dir) = &self.uploads_dir {
            ark_store::fs::validate_path(dir, false)
                .map_err(|_| ServerError::Config(format!("invalid uploads_dir {dir:?}")))?;
            if dir.split('/').next() == Some(crate::state::OBJECTS_DIR) {
                return Err(ServerError::Config(format!(
                    "uploads_dir {dir:?} is inside {:?}, where objects are stored",
                    crate::state::OBJECTS_DIR
                )));
            }
        }
        let mut ids = vec![self.storage_root_id.as_str()];
        let mut paths = vec![&self.root];
        for root in &self.roots {
            if root.id.is_empty() {
                return Err(ServerError::Config("storage root ids must not be empty".into()));
            }
            if ids.contains(&root.id.as_str()) {
                return Err(ServerError::Config(format!("duplicate storage root id {:?}", root.id)));
            }
            if paths.contains(&&root.path) {
                return Err(ServerError::Config(format!(
                    "storage root {:?} shares its directory {} with another root",
                    root.id,
                    root.path.display()
                )));
            }
            ids.push(&root.id);
            paths.push(&root.path);
        }
        Ok(())
    }
}
