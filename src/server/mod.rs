//! HTTP surface: task submission, polling, result/media retrieval and
//! violation review. See spec §6. Request parsing, multipart handling and
//! CORS are the ambient axum/tower-http stack; the router wires directly
//! into `TaskStore` for everything else.

pub mod http;

use crate::config::Config;
use crate::persistence::PersistenceService;
use crate::task_store::TaskStore;
use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, patch, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared router state: the task store plus whatever static config the
/// handlers need directly (upload size limits).
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<TaskStore>,
    pub config: Arc<Config>,
}

/// Maximum multipart body accepted for the transcript-upload and
/// compliance-audit routes; larger than the rule-file-specific 2 MB cap
/// enforced inside the handler because this also bounds media uploads.
const MAX_UPLOAD_BODY_BYTES: usize = 2 * 1024 * 1024 * 1024;

pub fn router(state: ServerState) -> Router {
    let uploads = Router::new()
        .route("/api/v1/tasks/transcript", post(http::submit_transcript))
        .route("/api/v1/evaluate/text/async", post(http::submit_text_evaluation))
        .route("/api/v1/compliance/audit/async", post(http::submit_compliance_audit))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES));

    let rest = Router::new()
        .route("/api/v1/tasks/{id}", get(http::get_task))
        .route("/api/v1/tasks/{id}/results", get(http::get_task_results))
        .route("/api/v1/tasks/{id}/media", get(http::get_task_media))
        .route("/api/v1/tasks/{id}/audio", get(http::get_task_audio))
        .route("/api/v1/tasks/{id}/frames/{filename}", get(http::get_task_frame))
        .route("/api/v1/tasks/{id}/rerun-transcript", post(http::rerun_transcript))
        .route("/api/v1/tasks/{id}/rerun-evaluation", post(http::rerun_evaluation))
        .route("/api/v1/tasks/{id}/compliance/violations", patch(http::patch_violations));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .merge(uploads)
        .merge(rest)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the task store, restore on-disk state, and serve the HTTP API
/// until the process is killed.
pub async fn serve(config: Config) -> Result<()> {
    let persistence = Arc::new(
        PersistenceService::new(&config.persistence.uploads_dir)
            .context("failed to initialize uploads directory")?,
    );
    let addr_host = config.server.host.clone();
    let addr_port = config.server.port;
    let store = Arc::new(TaskStore::new(config.clone(), persistence));
    store.restore_from_disk().await;

    let state = ServerState {
        store,
        config: Arc::new(config),
    };

    let app = router(state);
    let addr = format!("{}:{}", addr_host, addr_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("server loop exited")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> (ServerState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let persistence = Arc::new(PersistenceService::new(dir.path()).unwrap());
        let store = Arc::new(TaskStore::new(config.clone(), persistence));
        (
            ServerState {
                store,
                config: Arc::new(config),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn unknown_task_status_is_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/api/v1/tasks/does-not-exist").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_task_results_is_404() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/tasks/does-not-exist/results")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn patch_violations_on_task_with_no_report_is_server_error() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri("/api/v1/tasks/some-task/compliance/violations")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"updates":[{"index":0,"status":"confirmed"}]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn frame_path_traversal_is_rejected() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/tasks/some-task/frames/..%2F..%2Fetc%2Fpasswd")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn rerun_transcript_for_unknown_task_is_server_error() {
        let (state, _dir) = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/tasks/does-not-exist/rerun-transcript")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
