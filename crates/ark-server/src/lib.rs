//! HTTP server for ark.
//!
//! Serves a set of named storage roots over JSON/HTTP: object reads and
//! downloads, commits from upload sessions or existing objects, deletes,
//! and the upload-session lifecycle. All mutation goes through the lease protocol
//! of [`ark_store::StorageRoot`]; a lease conflict is reported as
//! `409 Conflict`, never waited on.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod state;

pub use auth::{Action, AllowAllAuth, AuthProvider, Credentials, Identity};
pub use config::{RootConfig, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::ArkServer;
pub use state::AppState;

#[cfg(test)]
mod tests {
    use super::*;
    use ark_digest::{digest_hex, DigestAlgorithm};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn app(dir: &tempfile::TempDir, config: ServerConfig) -> Router {
        let config = ServerConfig {
            root: dir.path().to_path_buf(),
            ..config
        };
        router::build_router(AppState::from_config(config).unwrap())
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let (status, bytes) = send(app, method, uri, Body::from(body.to_string())).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn new_session(app: &Router, algs: &[&str]) -> String {
        let (status, body) =
            send_json(app, "POST", "/v1/uploads", json!({ "digest_algorithms": algs })).await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ServerConfig::default());
        let (status, body) = send_json(&app, "GET", "/v1/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn info_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ServerConfig::default());
        let (status, body) = send_json(&app, "GET", "/v1/info", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["default_root"], "default");
        assert_eq!(body["storage_roots"], json!(["default"]));
        assert_eq!(body["uploads"], true);
    }

    #[tokio::test]
    async fn upload_commit_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ServerConfig::default());
        let session = new_session(&app, &["sha256", "md5"]).await;

        let (status, bytes) = send(
            &app,
            "POST",
            &format!("/v1/uploads/{session}"),
            Body::from("test content"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let upload: Value = serde_json::from_slice(&bytes).unwrap();
        let sha256 = digest_hex(DigestAlgorithm::Sha256, b"test content");
        assert_eq!(upload["digests"]["sha256"], sha256.as_str());
        assert_eq!(upload["size"], 12);

        let (status, body) = send_json(
            &app,
            "POST",
            "/v1/roots/default/objects/obj-1/commit",
            json!({
                "digest_algorithm": "sha256",
                "state": { "docs/readme.txt": sha256 },
                "message": "first version",
                "upload_session": session,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["object_id"], "obj-1");

        let (status, body) = send_json(&app, "GET", "/v1/roots/default/objects/obj-1", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 1);
        assert_eq!(body["head"], 1);
        assert_eq!(body["message"], "first version");
        assert_eq!(body["user"]["name"], "anonymous");
        let file = &body["state"][sha256.as_str()];
        assert_eq!(file["paths"][0], "docs/readme.txt");
        assert_eq!(
            file["fixity"]["md5"],
            digest_hex(DigestAlgorithm::Md5, b"test content").as_str()
        );

        let (status, bytes) = send(
            &app,
            "GET",
            "/v1/roots/default/objects/obj-1/content/docs/readme.txt",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"test content");

        let (status, body) = send_json(&app, "GET", "/v1/roots/default/objects/obj-1/manifest", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["manifest"].as_object().unwrap().len(), 1);

        // Session content is gone once the session is deleted.
        let (status, _) = send(&app, "DELETE", &format!("/v1/uploads/{session}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &format!("/v1/uploads/{session}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // A second object reuses the first object's content.
        let (status, body) = send_json(
            &app,
            "POST",
            "/v1/roots/default/objects/obj-2/commit",
            json!({
                "digest_algorithm": "sha256",
                "state": { "copy.txt": sha256 },
                "message": "copied",
                "user": { "name": "Ada", "address": "mailto:ada@example.org" },
                "source_object": "obj-1",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let (_, body) = send_json(&app, "GET", "/v1/roots/default/objects/obj-2", Value::Null).await;
        assert_eq!(body["user"]["name"], "Ada");

        let (status, _) = send(&app, "DELETE", "/v1/roots/default/objects/obj-1", Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send_json(&app, "GET", "/v1/roots/default/objects/obj-1", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("obj-1"));
        let (status, _) = send(&app, "GET", "/v1/roots/default/objects/obj-2/content/copy.txt", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn commit_conflicts_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ServerConfig::default());
        let empty = json!({ "digest_algorithm": "sha512", "state": {}, "message": "m" });
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", empty.clone()).await;
        assert_eq!(status, StatusCode::OK);

        let mut stale = empty.clone();
        stale["version"] = json!(1);
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", stale).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let mut md5 = empty.clone();
        md5["digest_algorithm"] = json!("md5");
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", md5).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut no_message = empty.clone();
        no_message["message"] = json!("");
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", no_message).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let bad_state = json!({
            "digest_algorithm": "sha512",
            "state": { "../escape": digest_hex(DigestAlgorithm::Sha512, b"x") },
            "message": "m",
        });
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", bad_state).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = json!({
            "digest_algorithm": "sha512",
            "state": { "a.txt": digest_hex(DigestAlgorithm::Sha512, b"never uploaded") },
            "message": "m",
        });
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", missing).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut own_source = empty.clone();
        own_source["source_object"] = json!("o");
        let (status, _) = send_json(&app, "POST", "/v1/roots/default/objects/o/commit", own_source).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send_json(&app, "GET", "/v1/roots/default/objects/o?version=9", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/v1/roots/default/objects/o/content/nope.txt", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", "/v1/roots/default/objects/missing", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn session_validation() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, ServerConfig::default());
        let (status, _) =
            send_json(&app, "POST", "/v1/uploads", json!({ "digest_algorithms": ["md5"] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send_json(
            &app,
            "POST",
            "/v1/uploads",
            json!({ "digest_algorithms": ["sha256", "crc32"] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let a = new_session(&app, &["sha256"]).await;
        let b = new_session(&app, &["sha512"]).await;
        let (status, body) = send_json(&app, "GET", "/v1/uploads", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessions"].as_array().unwrap().len(), 2);

        let (status, body) = send_json(&app, "GET", &format!("/v1/uploads/{a}"), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_id"], "anonymous");
        assert_eq!(body["uploads"].as_array().unwrap().len(), 0);

        // A sha512 commit can't draw on a sha256-only session.
        let (status, _) = send_json(
            &app,
            "POST",
            "/v1/roots/default/objects/x/commit",
            json!({
                "digest_algorithm": "sha512",
                "state": {},
                "message": "m",
                "upload_session": a,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, "POST", "/v1/uploads/unknown", Body::from("x")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "DELETE", &format!("/v1/uploads/{b}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(
            &dir,
            ServerConfig {
                max_upload_size: 4,
                ..ServerConfig::default()
            },
        );
        let session = new_session(&app, &["sha256"]).await;
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/v1/uploads/{session}"))
                    .header(header::CONTENT_LENGTH, "14")
                    .body(Body::from("more than four"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn anonymous_access_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(
            &dir,
            ServerConfig {
                allow_anonymous: false,
                ..ServerConfig::default()
            },
        );
        let (status, _) = send_json(&app, "GET", "/v1/uploads", Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/uploads")
                    .header(header::AUTHORIZATION, "Bearer secret-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn uploads_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(
            &dir,
            ServerConfig {
                uploads_dir: None,
                ..ServerConfig::default()
            },
        );
        let (status, _) =
            send_json(&app, "POST", "/v1/uploads", json!({ "digest_algorithms": ["sha256"] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sessions_survive_restart_with_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            journal_path: Some(dir.path().join("sessions.journal")),
            ..ServerConfig::default()
        };
        let session = {
            let app = app(&dir, config.clone());
            let session = new_session(&app, &["sha256"]).await;
            let (status, _) =
                send(&app, "POST", &format!("/v1/uploads/{session}"), Body::from("kept")).await;
            assert_eq!(status, StatusCode::CREATED);
            session
        };

        let app = app(&dir, config);
        let (status, body) =
            send_json(&app, "GET", &format!("/v1/uploads/{session}"), Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uploads"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn objects_are_scoped_to_their_root() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        let app = app(
            &dir,
            ServerConfig {
                roots: vec![RootConfig {
                    id: "archive".into(),
                    path: archive.path().to_path_buf(),
                }],
                ..ServerConfig::default()
            },
        );
        let (status, body) = send_json(&app, "GET", "/v1/roots", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["roots"], json!(["archive", "default"]));

        let session = new_session(&app, &["sha256"]).await;
        let (status, _) = send(
            &app,
            "POST",
            &format!("/v1/uploads/{session}"),
            Body::from("archived"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let sha256 = digest_hex(DigestAlgorithm::Sha256, b"archived");
        let (status, body) = send_json(
            &app,
            "POST",
            "/v1/roots/archive/objects/doc/commit",
            json!({
                "digest_algorithm": "sha256",
                "state": { "doc.txt": sha256 },
                "message": "into the archive",
                "upload_session": session,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["storage_root_id"], "archive");

        let (status, body) = send_json(&app, "GET", "/v1/roots/archive/objects/doc", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage_root_id"], "archive");
        let (status, _) = send(&app, "GET", "/v1/roots/default/objects/doc", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send_json(&app, "GET", "/v1/roots/nowhere/objects/doc", Value::Null).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nowhere"));
        assert!(archive.path().join(state::OBJECTS_DIR).is_dir());

        // Copy across roots.
        let (status, body) = send_json(
            &app,
            "POST",
            "/v1/roots/default/objects/doc/commit",
            json!({
                "digest_algorithm": "sha256",
                "state": { "copy.txt": sha256 },
                "message": "from the archive",
                "source_object": "doc",
                "source_root": "archive",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let (status, bytes) = send(
            &app,
            "GET",
            "/v1/roots/default/objects/doc/content/copy.txt",
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"archived");

        let (status, _) = send_json(
            &app,
            "POST",
            "/v1/roots/default/objects/other/commit",
            json!({
                "digest_algorithm": "sha256",
                "state": {},
                "message": "m",
                "source_object": "doc",
                "source_root": "nowhere",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send_json(
            &app,
            "POST",
            "/v1/roots/nowhere/objects/x/commit",
            json!({ "digest_algorithm": "sha256", "state": {}, "message": "m" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
