//! Axum + Askama status surface for the bridge.

use std::future::Future;
use std::sync::Arc;

use askama::Template;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum::extract::State;
use ghb_storage::WatermarkStore;
use ghb_sync::{status_snapshot, Migrator, RunReporter, SyncError};
use serde_json::json;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "ghb-web";

#[derive(Clone)]
pub struct AppState {
    pub reporter: Arc<RunReporter>,
    pub store: Arc<WatermarkStore>,
    pub migrator: Arc<Migrator>,
}

impl AppState {
    pub fn new(migrator: Arc<Migrator>) -> Self {
        Self {
            reporter: migrator.reporter().clone(),
            store: migrator.store().clone(),
            migrator,
        }
    }
}

struct LaneRow {
    metric: String,
    fetched: usize,
    uploaded: usize,
    skipped: usize,
    failed: usize,
}

struct WatermarkRow {
    lane: String,
    last_migrated_at: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    last_run_id: String,
    finished_at: String,
    lanes: Vec<LaneRow>,
    watermarks: Vec<WatermarkRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/status", get(status_handler))
        .route("/healthz", get(healthz_handler))
        .route("/run", post(run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = status_snapshot(&state.reporter, &state.store).await;

    let (last_run_id, finished_at, lanes) = match &snapshot.last_run {
        Some(run) => (
            run.run_id.to_string(),
            run.finished_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            run.per_metric
                .iter()
                .map(|(metric, outcome)| LaneRow {
                    metric: metric.to_string(),
                    fetched: outcome.fetched,
                    uploaded: outcome.uploaded,
                    skipped: outcome.skipped_duplicate,
                    failed: outcome.failed,
                })
                .collect(),
        ),
        None => ("never".to_string(), "n/a".to_string(), Vec::new()),
    };

    let watermarks = snapshot
        .watermarks
        .iter()
        .map(|wm| WatermarkRow {
            lane: format!("{}/{}", wm.source, wm.metric_type),
            last_migrated_at: wm
                .last_migrated_at
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string(),
        })
        .collect();

    render_html(IndexTemplate {
        last_run_id,
        finished_at,
        lanes,
        watermarks,
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = status_snapshot(&state.reporter, &state.store).await;
    Json(snapshot).into_response()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.migrator.run().await {
        Ok(result) => Json(result).into_response(),
        Err(SyncError::RunAlreadyInProgress) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a migration run is already in progress" })),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use ghb_adapters::{ClientError, SinkClient, UploadOutcome};
    use ghb_core::Measurement;
    use ghb_sync::ServiceRegistry;
    use http_body_util::BodyExt;
    use tokio::sync::watch;
    use tower::ServiceExt;

    struct StubSink;

    #[async_trait]
    impl SinkClient for StubSink {
        fn name(&self) -> &'static str {
            "garmin"
        }

        async fn authenticate(&self) -> Result<(), ClientError> {
            Ok(())
        }

        async fn upload(&self, _measurement: &Measurement) -> Result<UploadOutcome, ClientError> {
            Ok(UploadOutcome::Accepted)
        }
    }

    async fn test_state(dir: &std::path::Path) -> AppState {
        let store = Arc::new(
            WatermarkStore::open(dir.join("watermarks.json"))
                .await
                .expect("open store"),
        );
        let (_tx, rx) = watch::channel(false);
        let migrator = Arc::new(Migrator::new(
            Vec::new(),
            Arc::new(StubSink),
            store,
            Arc::new(RunReporter::new()),
            ServiceRegistry::default().bounds(),
            rx,
        ));
        AppState::new(migrator)
    }

    #[tokio::test]
    async fn index_renders_dashboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(dir.path()).await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Garmin Health Bridge"));
        assert!(text.contains("never"));
    }

    #[tokio::test]
    async fn status_reports_no_run_yet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(dir.path()).await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value["last_run"].is_null());
        assert!(value["watermarks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_trigger_runs_and_reports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path()).await;
        let reporter = state.reporter.clone();
        let app = app(state);

        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(reporter.latest().await.is_some());
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = app(test_state(dir.path()).await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
