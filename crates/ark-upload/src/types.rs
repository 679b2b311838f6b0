use ark_digest::DigestSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable settings for one upload session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Owner of the session.
    pub user_id: String,
    /// Every upload is digested with each of these.
    pub digest_algorithms: Vec<String>,
    pub description: String,
}

impl SessionConfig {
    pub fn uses_algorithm(&self, alg: &str) -> bool {
        self.digest_algorithms.iter().any(|a| a == alg)
    }
}

/// One file streamed into a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    /// File name relative to the session's directory.
    pub name: String,
    pub size: u64,
    /// Algorithm name to hex digest, one per configured algorithm.
    pub digests: DigestSet,
}

/// The persistent form of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub uploads: Vec<Upload>,
}
