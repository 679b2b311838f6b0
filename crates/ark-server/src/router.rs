use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::handler;
use crate::state::AppState;

/// Build the axum router with all ark endpoints.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_upload_size).unwrap_or(usize::MAX);
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/info", get(handler::info_handler))
        .route("/v1/roots", get(handler::list_roots_handler))
        .route(
            "/v1/roots/:root/objects/:id",
            get(handler::get_object_handler).delete(handler::delete_object_handler),
        )
        .route(
            "/v1/roots/:root/objects/:id/manifest",
            get(handler::get_manifest_handler),
        )
        .route(
            "/v1/roots/:root/objects/:id/content/*path",
            get(handler::get_content_handler),
        )
        .route(
            "/v1/roots/:root/objects/:id/commit",
            post(handler::commit_handler),
        )
        .route(
            "/v1/uploads",
            get(handler::list_sessions_handler).post(handler::new_session_handler),
        )
        .route(
            "/v1/uploads/:id",
            get(handler::get_session_handler)
                .delete(handler::delete_session_handler)
                .post(handler::upload_handler)
                .layer(RequestBodyLimitLayer::new(upload_limit)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
