//! Commit inputs: the staged logical state, its content and fixity sources,
//! and commit options.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use ark_digest::{DigestAlgorithm, DigestSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::fs::WriteFs;

/// Digest to the logical (or content) paths holding it.
pub type DigestMap = BTreeMap<String, Vec<String>>;

/// Commit author.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

/// Paths sharing one digest, plus fixity digests for that content.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub paths: Vec<String>,
    #[serde(default)]
    pub fixity: DigestSet,
}

/// Where to read the bytes for a digest.
#[derive(Clone, Debug)]
pub struct ContentRef {
    pub fs: Arc<dyn WriteFs>,
    pub path: String,
}

/// Something that can provide content for digests being committed.
pub trait ContentSource: Send + Sync {
    fn get_content(&self, digest: &str) -> Option<ContentRef>;
}

/// Something that can provide fixity digests for content being committed.
pub trait FixitySource: Send + Sync {
    fn get_fixity(&self, digest: &str) -> DigestSet;
}

/// A complete logical state staged for commit.
#[derive(Clone)]
pub struct Stage {
    pub digest_algorithm: DigestAlgorithm,
    pub state: DigestMap,
    content: Vec<Arc<dyn ContentSource>>,
    fixity: Vec<Arc<dyn FixitySource>>,
}

impl Stage {
    /// Empty stage. Committing it creates a version with no files.
    pub fn new(digest_algorithm: DigestAlgorithm) -> Self {
        Self {
            digest_algorithm,
            state: DigestMap::new(),
            content: Vec::new(),
            fixity: Vec::new(),
        }
    }

    /// Build a stage from a logical path to digest map. The result is
    /// validated.
    pub fn from_path_map(
        digest_algorithm: DigestAlgorithm,
        paths: &BTreeMap<String, String>,
    ) -> StoreResult<Self> {
        let mut state = DigestMap::new();
        for (path, digest) in paths {
            state.entry(digest.clone()).or_default().push(path.clone());
        }
        let stage = Self {
            state,
            ..Self::new(digest_algorithm)
        };
        stage.validate()?;
        Ok(stage)
    }

    /// Add a content source. Sources are consulted in the order added.
    pub fn with_content(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.content.push(source);
        self
    }

    /// Add a fixity source. Fixity from every source is merged.
    pub fn with_fixity(mut self, source: Arc<dyn FixitySource>) -> Self {
        self.fixity.push(source);
        self
    }

    /// Merge another content/fixity source pair into the stage.
    pub fn overlay(
        &mut self,
        content: Option<Arc<dyn ContentSource>>,
        fixity: Option<Arc<dyn FixitySource>>,
    ) {
        self.content.extend(content);
        self.fixity.extend(fixity);
    }

    pub fn get_content(&self, digest: &str) -> Option<ContentRef> {
        self.content.iter().find_map(|src| src.get_content(digest))
    }

    pub fn get_fixity(&self, digest: &str) -> DigestSet {
        let mut set = DigestSet::new();
        for src in &self.fixity {
            for (alg, value) in src.get_fixity(digest) {
                set.entry(alg).or_insert(value);
            }
        }
        set
    }

    /// Logical path to digest.
    pub fn path_map(&self) -> BTreeMap<String, String> {
        self.state
            .iter()
            .flat_map(|(digest, paths)| paths.iter().map(move |p| (p.clone(), digest.clone())))
            .collect()
    }

    /// Check digests and logical paths.
    ///
    /// Every digest must be lowercase hex of the stage's algorithm. Every
    /// logical path must be a clean relative path, appear once, and not also
    /// be used as a directory by another path.
    pub fn validate(&self) -> StoreResult<()> {
        let mut files: HashSet<&str> = HashSet::new();
        for (digest, paths) in &self.state {
            if !self.digest_algorithm.is_valid_hex(digest) {
                return Err(StoreError::InvalidStage(format!(
                    "{digest:?} is not a valid {} digest",
                    self.digest_algorithm
                )));
            }
            if paths.is_empty() {
                return Err(StoreError::InvalidStage(format!(
                    "digest {digest} has no paths"
                )));
            }
            for path in paths {
                if crate::fs::validate_path(path, false).is_err() {
                    return Err(StoreError::InvalidStage(format!(
                        "invalid logical path {path:?}"
                    )));
                }
                if !files.insert(path.as_str()) {
                    return Err(StoreError::InvalidStage(format!(
                        "duplicate logical path {path:?}"
                    )));
                }
            }
        }
        for path in &files {
            let mut prefix = *path;
            while let Some((parent, _)) = prefix.rsplit_once('/') {
                if files.contains(parent) {
                    return Err(StoreError::InvalidStage(format!(
                        "logical path {parent:?} is both a file and a directory"
                    )));
                }
                prefix = parent;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("digest_algorithm", &self.digest_algorithm)
            .field("state", &self.state)
            .field("content_sources", &self.content.len())
            .field("fixity_sources", &self.fixity.len())
            .finish()
    }
}

/// Options applied to one commit.
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    pub message: String,
    pub user: Option<User>,
    /// Version timestamp; defaults to the time of the commit.
    pub created: Option<DateTime<Utc>>,
    /// If set, the new version must have exactly this number.
    pub head: Option<u32>,
}

impl CommitOptions {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_head(mut self, head: u32) -> Self {
        self.head = Some(head);
        self
    }
}
