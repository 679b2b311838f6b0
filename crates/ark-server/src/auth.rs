use std::fmt;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};

use crate::error::ServerResult;

/// Who is making a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub address: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".into(),
            address: None,
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Anonymous,
}

impl Credentials {
    /// Read a bearer token from the `Authorization` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| Self::Bearer(token.to_string()))
            .unwrap_or(Self::Anonymous)
    }
}

/// Something a caller asks to do. Object actions name the storage root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    ReadObject { storage_root_id: String, object_id: String },
    CommitObject { storage_root_id: String, object_id: String },
    DeleteObject { storage_root_id: String, object_id: String },
    Upload,
}

impl Action {
    pub fn read(root: &str, object_id: &str) -> Self {
        Self::ReadObject {
            storage_root_id: root.to_string(),
            object_id: object_id.to_string(),
        }
    }

    pub fn commit(root: &str, object_id: &str) -> Self {
        Self::CommitObject {
            storage_root_id: root.to_string(),
            object_id: object_id.to_string(),
        }
    }

    pub fn delete(root: &str, object_id: &str) -> Self {
        Self::DeleteObject {
            storage_root_id: root.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadObject {
                storage_root_id,
                object_id,
            } => write!(f, "read:{storage_root_id}/{object_id}"),
            Self::CommitObject {
                storage_root_id,
                object_id,
            } => write!(f, "commit:{storage_root_id}/{object_id}"),
            Self::DeleteObject {
                storage_root_id,
                object_id,
            } => write!(f, "delete:{storage_root_id}/{object_id}"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity>;
    async fn authorize(&self, identity: &Identity, action: &Action) -> ServerResult<bool>;
}

/// Accepts every credential and allows every action.
pub struct AllowAllAuth;

#[async_trait]
impl AuthProvider for AllowAllAuth {
    async fn authenticate(&self, credentials: &Credentials) -> ServerResult<Identity> {
        match credentials {
            Credentials::Bearer(token) => {
                let prefix: String = token.chars().take(8).collect();
                Ok(Identity::user(format!("bearer:{prefix}")))
            }
            Credentials::Anonymous => Ok(Identity::anonymous()),
        }
    }

    async fn authorize(&self, _identity: &Identity, _action: &Action) -> ServerResult<bool> {
        Ok(true)
    }
}
