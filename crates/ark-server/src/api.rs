//! JSON bodies exchanged over the HTTP API.

use std::collections::BTreeMap;

use ark_digest::DigestAlgorithm;
use ark_store::{FileInfo, ObjectManifest, ObjectVersion, User};
use ark_upload::{SessionRecord, Upload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct VersionQuery {
    /// Version number; 0 or absent means the head version.
    #[serde(default)]
    pub version: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectVersionResponse {
    pub storage_root_id: String,
    pub object_id: String,
    pub version: u32,
    pub head: u32,
    pub digest_algorithm: DigestAlgorithm,
    pub state: BTreeMap<String, FileInfo>,
    pub message: String,
    pub user: Option<User>,
    pub created: DateTime<Utc>,
}

impl From<&ObjectVersion> for ObjectVersionResponse {
    fn from(v: &ObjectVersion) -> Self {
        Self {
            storage_root_id: v.storage_root_id.clone(),
            object_id: v.object_id.clone(),
            version: v.version,
            head: v.head,
            digest_algorithm: v.digest_algorithm,
            state: v.state.clone(),
            message: v.message.clone(),
            user: v.user.clone(),
            created: v.created,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestResponse {
    pub storage_root_id: String,
    pub object_id: String,
    pub digest_algorithm: DigestAlgorithm,
    pub head: u32,
    pub manifest: BTreeMap<String, FileInfo>,
}

impl From<&ObjectManifest> for ManifestResponse {
    fn from(m: &ObjectManifest) -> Self {
        Self {
            storage_root_id: m.storage_root_id.clone(),
            object_id: m.object_id.clone(),
            digest_algorithm: m.digest_algorithm,
            head: m.head,
            manifest: m.manifest.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    /// `sha256` or `sha512`.
    pub digest_algorithm: String,
    /// Logical path to digest for the complete new version.
    pub state: BTreeMap<String, String>,
    pub message: String,
    #[serde(default)]
    pub user: Option<User>,
    /// Expected number of the new version.
    #[serde(default)]
    pub version: Option<u32>,
    /// Upload session providing new content.
    #[serde(default)]
    pub upload_session: Option<String>,
    /// Existing object providing content.
    #[serde(default)]
    pub source_object: Option<String>,
    /// Storage root of `source_object`; the commit's own root when absent.
    #[serde(default)]
    pub source_root: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootListResponse {
    pub roots: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub storage_root_id: String,
    pub object_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewSessionRequest {
    pub digest_algorithms: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewSessionResponse {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub id: String,
    pub user_id: String,
    pub digest_algorithms: Vec<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub uploads: Vec<Upload>,
}

impl From<SessionRecord> for SessionResponse {
    fn from(r: SessionRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.config.user_id,
            digest_algorithms: r.config.digest_algorithms,
            description: r.config.description,
            created_at: r.created_at,
            uploads: r.uploads,
        }
    }
}
