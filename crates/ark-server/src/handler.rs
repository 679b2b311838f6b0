use std::io;
use std::sync::Arc;

use ark_digest::DigestAlgorithm;
use ark_store::{CommitOptions, ContentSource, FixitySource, Stage, User};
use ark_upload::{SessionConfig, Upload};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use crate::api::{
    CommitRequest, CommitResponse, HealthResponse, ManifestResponse, NewSessionRequest,
    NewSessionResponse, ObjectVersionResponse, RootListResponse, SessionListResponse,
    SessionResponse, VersionQuery,
};
use crate::auth::{Action, Credentials, Identity};
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

/// Authenticate the caller and check it may perform `action`.
async fn authorize(state: &AppState, headers: &HeaderMap, action: Action) -> ServerResult<Identity> {
    let credentials = Credentials::from_headers(headers);
    if credentials == Credentials::Anonymous && !state.config.allow_anonymous {
        return Err(ServerError::AuthFailed("credentials required".into()));
    }
    let identity = state.auth.authenticate(&credentials).await?;
    if !state.auth.authorize(&identity, &action).await? {
        return Err(ServerError::AuthorizationDenied {
            action: action.to_string(),
        });
    }
    Ok(identity)
}

fn invalid(msg: impl Into<String>) -> ServerError {
    ServerError::InvalidArgument(msg.into())
}

fn primary_algorithm(name: &str) -> ServerResult<DigestAlgorithm> {
    match name.parse::<DigestAlgorithm>() {
        Ok(alg) if alg.is_primary() => Ok(alg),
        _ => Err(invalid(format!(
            "digest algorithm must be {} or {}",
            DigestAlgorithm::Sha512,
            DigestAlgorithm::Sha256
        ))),
    }
}

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

pub async fn info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "ark-server",
        "version": env!("CARGO_PKG_VERSION"),
        "default_root": state.config.storage_root_id,
        "storage_roots": state.roots.keys().collect::<Vec<_>>(),
        "uploads": state.uploads.is_some(),
    }))
}

pub async fn list_roots_handler(State(state): State<AppState>) -> Json<RootListResponse> {
    Json(RootListResponse {
        roots: state.roots.keys().cloned().collect(),
    })
}

pub async fn get_object_handler(
    State(state): State<AppState>,
    Path((root_id, object_id)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
) -> ServerResult<Json<ObjectVersionResponse>> {
    authorize(&state, &headers, Action::read(&root_id, &object_id)).await?;
    let version = state
        .root(&root_id)?
        .get_object_version(&object_id, query.version.unwrap_or(0))
        .await?;
    let body = ObjectVersionResponse::from(&version);
    version.close();
    Ok(Json(body))
}

pub async fn get_manifest_handler(
    State(state): State<AppState>,
    Path((root_id, object_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ServerResult<Json<ManifestResponse>> {
    authorize(&state, &headers, Action::read(&root_id, &object_id)).await?;
    let manifest = state.root(&root_id)?.get_object_manifest(&object_id).await?;
    let body = ManifestResponse::from(&manifest);
    manifest.close();
    Ok(Json(body))
}

/// Stream one logical file. The read lease is held until the response body
/// is finished or dropped.
pub async fn get_content_handler(
    State(state): State<AppState>,
    Path((root_id, object_id, path)): Path<(String, String, String)>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
) -> ServerResult<Response> {
    authorize(&state, &headers, Action::read(&root_id, &object_id)).await?;
    let version = state
        .root(&root_id)?
        .get_object_version(&object_id, query.version.unwrap_or(0))
        .await?;
    let logical_path = path.trim_start_matches('/');
    let reader = version.open_file(logical_path).await?;
    let stream = ReaderStream::new(reader).map(move |chunk| {
        let _lease = &version;
        chunk
    });
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn commit_handler(
    State(state): State<AppState>,
    Path((root_id, object_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<CommitRequest>,
) -> ServerResult<Json<CommitResponse>> {
    let identity = authorize(&state, &headers, Action::commit(&root_id, &object_id)).await?;
    let root = state.root(&root_id)?;
    let alg = primary_algorithm(&req.digest_algorithm)?;
    if req.message.is_empty() {
        return Err(invalid("missing required 'message' value"));
    }
    let user = match req.user {
        Some(user) if !user.name.is_empty() => user,
        _ if identity.name.is_empty() => return Err(invalid("missing required user name")),
        _ => User {
            name: identity.name.clone(),
            address: identity.address.clone(),
        },
    };
    let mut stage = Stage::from_path_map(alg, &req.state)
        .map_err(|e| invalid(format!("commit request includes invalid object state: {e}")))?;

    if let Some(session_id) = &req.upload_session {
        let session = state.uploads()?.get_session(session_id).await?;
        if !session.config().uses_algorithm(alg.as_str()) {
            return Err(invalid(format!(
                "upload session {session_id} doesn't compute {alg}, the commit's digest algorithm"
            )));
        }
        let content: Arc<dyn ContentSource> = Arc::new(session.content_source(alg.as_str())?);
        let fixity: Arc<dyn FixitySource> = Arc::new(session.fixity_source(alg.as_str())?);
        stage.overlay(Some(content), Some(fixity));
        debug!(object_id = %object_id, session_id = %session_id, "staging content from upload session");
        session.close();
    }
    if let Some(source_id) = &req.source_object {
        let source_root_id = req.source_root.as_deref().unwrap_or(&root_id);
        if source_root_id == root_id && *source_id == object_id {
            return Err(invalid("an object can't be its own content source"));
        }
        authorize(&state, &headers, Action::read(source_root_id, source_id)).await?;
        let source_root = state.root(source_root_id).map_err(|_| {
            invalid(format!("unknown storage root for source object: {source_root_id}"))
        })?;
        let manifest = Arc::new(source_root.get_object_manifest(source_id).await?);
        if manifest.digest_algorithm != alg {
            return Err(invalid(format!(
                "commit declares {alg}, but source object {source_id} uses {}",
                manifest.digest_algorithm
            )));
        }
        let content: Arc<dyn ContentSource> = Arc::clone(&manifest) as Arc<dyn ContentSource>;
        let fixity: Arc<dyn FixitySource> = manifest;
        stage.overlay(Some(content), Some(fixity));
        debug!(
            object_id = %object_id,
            source_root = %source_root_id,
            source_id = %source_id,
            "staging content from existing object"
        );
    }

    let mut options = CommitOptions::new(req.message).with_user(user);
    if let Some(head) = req.version.filter(|v| *v > 0) {
        options = options.with_head(head);
    }
    root.commit(&object_id, stage, options).await?;
    info!(storage_root = %root_id, object_id = %object_id, user = %identity.name, "committed object");
    Ok(Json(CommitResponse {
        storage_root_id: root.id().to_string(),
        object_id,
    }))
}

pub async fn delete_object_handler(
    State(state): State<AppState>,
    Path((root_id, object_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ServerResult<StatusCode> {
    authorize(&state, &headers, Action::delete(&root_id, &object_id)).await?;
    state.root(&root_id)?.delete_object(&object_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn new_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<NewSessionRequest>,
) -> ServerResult<(StatusCode, Json<NewSessionResponse>)> {
    let identity = authorize(&state, &headers, Action::Upload).await?;
    let uploads = state.uploads()?;
    if !req
        .digest_algorithms
        .iter()
        .any(|a| primary_algorithm(a).is_ok())
    {
        return Err(invalid("upload sessions must include sha256 or sha512"));
    }
    for alg in &req.digest_algorithms {
        alg.parse::<DigestAlgorithm>()
            .map_err(|e| invalid(e.to_string()))?;
    }
    let id = uploads
        .new_session(SessionConfig {
            user_id: identity.name,
            digest_algorithms: req.digest_algorithms,
            description: req.description,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(NewSessionResponse { id })))
}

pub async fn list_sessions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Json<SessionListResponse>> {
    authorize(&state, &headers, Action::Upload).await?;
    let sessions = state.uploads()?.session_ids().await?;
    Ok(Json(SessionListResponse { sessions }))
}

pub async fn get_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<Json<SessionResponse>> {
    authorize(&state, &headers, Action::Upload).await?;
    let session = state.uploads()?.get_session(&session_id).await?;
    let record = session.record();
    session.close();
    Ok(Json(record.into()))
}

/// Stream the request body into the session as one new upload.
pub async fn upload_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> ServerResult<(StatusCode, Json<Upload>)> {
    authorize(&state, &headers, Action::Upload).await?;
    let session = state.uploads()?.get_session(&session_id).await?;
    let stream = body.into_data_stream().map(|r| r.map_err(io::Error::other));
    let upload = session.write(StreamReader::new(stream)).await;
    session.close();
    let upload = upload?;
    info!(session_id = %session_id, upload = %upload.name, size = upload.size, "received upload");
    Ok((StatusCode::CREATED, Json(upload)))
}

pub async fn delete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ServerResult<StatusCode> {
    authorize(&state, &headers, Action::Upload).await?;
    let session = state.uploads()?.get_session(&session_id).await?;
    session.delete().await?;
    session.close();
    Ok(StatusCode::NO_CONTENT)
}
