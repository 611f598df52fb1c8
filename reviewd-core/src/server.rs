//! HTTP query/mutation surface.
//!
//! Read endpoints return snapshots of the store; mutations are thin wrappers
//! over store primitives plus a manual reconciler trigger. All `/api`
//! responses carry `Cache-Control: no-store`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::assets;
use crate::executor::ReviewExecutor;
use crate::github::{PrGateway, RateLimitInfo};
use crate::poller::TriggerHandle;
use crate::pr::{PrId, TrackedPr, NOTES_MAX_CHARS};
use crate::state::{CachedRateLimit, SharedState};
use crate::status::PrStatus;
use crate::store::Store;

pub struct ApiState {
    pub store: Arc<Store>,
    pub shared: Arc<SharedState>,
    pub executor: Arc<ReviewExecutor>,
    pub gateway: Arc<dyn PrGateway>,
    pub trigger: TriggerHandle,
    pub reviews_dir: PathBuf,
    pub dev_mode: bool,
}

/// Build the full router.
pub fn router(state: Arc<ApiState>) -> Router {
    let api = Router::new()
        .route("/api/prs", get(list_prs))
        .route("/api/prs/delete", post(delete_pr).delete(delete_pr))
        .route("/api/prs/notes", post(update_notes).patch(update_notes))
        .route("/api/status", get(server_status))
        .route("/api/priorities", get(priorities))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let mut router = api.nest_service("/reviews", ServeDir::new(&state.reviews_dir));
    if !state.dev_mode {
        router = router.fallback(static_asset);
    }
    router.with_state(state)
}

/// Bind and serve until the token fires.
pub async fn serve(
    state: Arc<ApiState>,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http surface listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

// ── Read endpoints ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiPr {
    #[serde(flatten)]
    pr: TrackedPr,
    review_url: Option<String>,
    github_url: String,
}

impl ApiPr {
    fn from(pr: TrackedPr) -> Self {
        Self {
            review_url: pr.artifact_path.as_ref().map(|p| format!("/reviews/{p}")),
            github_url: pr.id.github_url(),
            pr,
        }
    }
}

async fn list_prs(State(state): State<Arc<ApiState>>) -> Response {
    match state.store.list_all() {
        Ok(rows) => Json(rows.into_iter().map(ApiPr::from).collect::<Vec<_>>()).into_response(),
        Err(e) => {
            warn!(error = %e, "listing tracked PRs failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Serialize, Default)]
struct StatusCounts {
    pending: u64,
    generating: u64,
    completed: u64,
    error: u64,
}

#[derive(Serialize)]
struct GeneratorStatus {
    running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_seconds: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    counts: StatusCounts,
    recent_completions: Vec<ApiPr>,
    uptime_seconds: u64,
    generator: GeneratorStatus,
    seconds_until_next_tick: Option<u64>,
    rate_limit: Option<RateLimitInfo>,
}

async fn server_status(State(state): State<Arc<ApiState>>) -> Response {
    let mut counts = StatusCounts::default();
    match state.store.counts_by_status() {
        Ok(list) => {
            for (status, n) in list {
                match status {
                    PrStatus::Pending => counts.pending = n,
                    PrStatus::Generating => counts.generating = n,
                    PrStatus::Completed => counts.completed = n,
                    PrStatus::Error => counts.error = n,
                }
            }
        }
        Err(e) => warn!(error = %e, "status counts failed"),
    }

    let recent = state
        .store
        .recent_completions(3)
        .unwrap_or_default()
        .into_iter()
        .map(ApiPr::from)
        .collect();

    let generator = match state.executor.running_task() {
        Some((id, elapsed)) => GeneratorStatus {
            running: true,
            pr: Some(id.to_string()),
            elapsed_seconds: Some(elapsed.as_secs()),
        },
        None => GeneratorStatus {
            running: false,
            pr: None,
            elapsed_seconds: None,
        },
    };

    let response = StatusResponse {
        counts,
        recent_completions: recent,
        uptime_seconds: state.shared.started_at.elapsed().as_secs(),
        generator,
        seconds_until_next_tick: state.shared.seconds_until_next_tick(),
        rate_limit: rate_limit_snapshot(&state).await,
    };
    Json(response).into_response()
}

/// Serve the cached rate-limit info, refreshing it from the remote at most
/// once per TTL window. A failed refresh falls back to whatever is cached.
async fn rate_limit_snapshot(state: &ApiState) -> Option<RateLimitInfo> {
    {
        let cached = state.shared.rate_limit.read().await;
        if let Some(c) = *cached {
            if c.is_fresh() {
                return Some(c.info);
            }
        }
    }
    match state.gateway.rate_limit().await {
        Ok(info) => {
            *state.shared.rate_limit.write().await = Some(CachedRateLimit {
                info,
                fetched_at: Instant::now(),
            });
            Some(info)
        }
        Err(e) => {
            warn!(error = %e, "rate-limit probe failed");
            state.shared.rate_limit.read().await.map(|c| c.info)
        }
    }
}

async fn priorities(State(state): State<Arc<ApiState>>) -> Response {
    match &*state.shared.priority.read().await {
        Some(report) => Json(report).into_response(),
        None => Json(serde_json::json!({})).into_response(),
    }
}

// ── Mutation endpoints ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct IdBody {
    owner: String,
    repo: String,
    number: u64,
}

impl IdBody {
    fn id(&self) -> PrId {
        PrId::new(self.owner.clone(), self.repo.clone(), self.number)
    }
}

async fn delete_pr(State(state): State<Arc<ApiState>>, Json(body): Json<IdBody>) -> Response {
    let id = body.id();
    if let Ok(Some(row)) = state.store.get(&id) {
        if let Some(artifact) = row.artifact_path.as_deref() {
            let _ = std::fs::remove_file(state.reviews_dir.join(artifact));
        }
    }
    match state.store.delete(&id) {
        Ok(existed) => {
            info!(pr = %id, existed, "tracked PR deleted");
            state.trigger.request();
            Json(serde_json::json!({ "status": "success" })).into_response()
        }
        Err(e) => {
            warn!(pr = %id, error = %e, "delete failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct NotesBody {
    owner: String,
    repo: String,
    number: u64,
    notes: String,
}

async fn update_notes(State(state): State<Arc<ApiState>>, Json(body): Json<NotesBody>) -> Response {
    let id = PrId::new(body.owner.clone(), body.repo.clone(), body.number);
    if body.notes.chars().count() > NOTES_MAX_CHARS {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": format!("notes must be at most {NOTES_MAX_CHARS} characters")
            })),
        )
            .into_response();
    }
    match state.store.update_notes(&id, &body.notes) {
        Ok(true) => Json(serde_json::json!({ "status": "success" })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown PR" })),
        )
            .into_response(),
        Err(e) => {
            warn!(pr = %id, error = %e, "notes update failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ── Static bundle ─────────────────────────────────────────────────────────────

async fn static_asset(uri: Uri) -> Response {
    let asset = assets::lookup(uri.path());
    (
        [
            (header::CONTENT_TYPE, asset.content_type),
            (header::CACHE_CONTROL, asset.cache_control),
        ],
        asset.body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;
    use crate::testing::{summary, MockGateway};
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _dir: TempDir,
        state: Arc<ApiState>,
        gateway: Arc<MockGateway>,
    }

    fn app(dev_mode: bool) -> TestApp {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(MockGateway::new());
        let executor = Arc::new(ReviewExecutor::new(
            dir.path().join("generator"),
            dir.path().join("reviews"),
        ));
        let shared = Arc::new(SharedState::new(std::time::Duration::from_secs(60)));
        let (_poller, trigger) = Poller::new(
            store.clone(),
            gateway.clone(),
            executor.clone(),
            shared.clone(),
            "me".to_string(),
            dir.path().join("reviews"),
            std::time::Duration::from_secs(60),
        );
        let state = Arc::new(ApiState {
            store,
            shared,
            executor,
            gateway: gateway.clone(),
            trigger,
            reviews_dir: dir.path().join("reviews"),
            dev_mode,
        });
        TestApp {
            _dir: dir,
            state,
            gateway,
        }
    }

    async fn request(
        app: &TestApp,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, axum::http::HeaderMap, serde_json::Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(path);
        let request = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                builder.body(axum::body::Body::from(json.to_string())).unwrap()
            }
            None => builder.body(axum::body::Body::empty()).unwrap(),
        };
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, headers, json)
    }

    fn seed(app: &TestApp, number: u64) -> PrId {
        app.state
            .store
            .upsert_summary(&summary("acme", "foo", number, "sha-a"), false)
            .unwrap();
        PrId::new("acme", "foo", number)
    }

    #[tokio::test]
    async fn list_includes_urls_and_no_store() {
        let app = app(false);
        let id = seed(&app, 7);
        let pr = app.state.store.get(&id).unwrap().unwrap();
        app.state.store.set_generating(&pr, chrono::Utc::now()).unwrap();
        app.state
            .store
            .complete_if_current(&id, "sha-a", "acme_foo_7.html", chrono::Utc::now())
            .unwrap();

        let (status, headers, json) = request(&app, "GET", "/api/prs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");

        let rows = json.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["owner"], "acme");
        assert_eq!(rows[0]["number"], 7);
        assert_eq!(rows[0]["review_url"], "/reviews/acme_foo_7.html");
        assert_eq!(rows[0]["github_url"], "https://github.com/acme/foo/pull/7");
    }

    #[tokio::test]
    async fn delete_removes_row_and_artifact_and_is_idempotent() {
        let app = app(false);
        let id = seed(&app, 7);
        let pr = app.state.store.get(&id).unwrap().unwrap();
        app.state.store.set_generating(&pr, chrono::Utc::now()).unwrap();
        app.state
            .store
            .complete_if_current(&id, "sha-a", "acme_foo_7.html", chrono::Utc::now())
            .unwrap();
        std::fs::create_dir_all(&app.state.reviews_dir).unwrap();
        let artifact = app.state.reviews_dir.join("acme_foo_7.html");
        std::fs::write(&artifact, "<html>").unwrap();

        let body = serde_json::json!({"owner": "acme", "repo": "foo", "number": 7});
        let (status, _, json) = request(&app, "POST", "/api/prs/delete", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert!(app.state.store.get(&id).unwrap().is_none());
        assert!(!artifact.exists());

        // Deleting an absent identity still succeeds.
        let (status, _, json) = request(&app, "DELETE", "/api/prs/delete", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
    }

    #[tokio::test]
    async fn delete_with_malformed_body_is_client_error() {
        let app = app(false);
        let body = serde_json::json!({"owner": "acme"});
        let (status, _, _) = request(&app, "POST", "/api/prs/delete", Some(body)).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn notes_mutation_respects_bound() {
        let app = app(false);
        let id = seed(&app, 7);

        let body = serde_json::json!({
            "owner": "acme", "repo": "foo", "number": 7, "notes": "hello world!!"
        });
        let (status, _, json) = request(&app, "POST", "/api/prs/notes", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(app.state.store.get(&id).unwrap().unwrap().notes, "hello world!!");

        let body = serde_json::json!({
            "owner": "acme", "repo": "foo", "number": 7, "notes": "too-long-a-note-xyz"
        });
        let (status, _, _) = request(&app, "PATCH", "/api/prs/notes", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(app.state.store.get(&id).unwrap().unwrap().notes, "hello world!!");
    }

    #[tokio::test]
    async fn notes_for_unknown_pr_is_not_found() {
        let app = app(false);
        let body = serde_json::json!({
            "owner": "acme", "repo": "foo", "number": 99, "notes": "x"
        });
        let (status, _, _) = request(&app, "POST", "/api/prs/notes", Some(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_counts_and_caches_rate_limit() {
        let app = app(false);
        seed(&app, 1);
        seed(&app, 2);

        let (status, _, json) = request(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["counts"]["pending"], 2);
        assert_eq!(json["generator"]["running"], false);
        assert_eq!(json["rate_limit"]["remaining"], 5000);
        // Ticker never started in this test.
        assert!(json["seconds_until_next_tick"].is_null());

        // Second request within the TTL reuses the cached rate limit.
        let _ = request(&app, "GET", "/api/status", None).await;
        assert_eq!(*app.gateway.rate_limit_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn priorities_empty_before_first_run() {
        let app = app(false);
        let (status, _, json) = request(&app, "GET", "/api/priorities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({}));

        let report = crate::priority::compute_report(&[], chrono::Utc::now());
        *app.state.shared.priority.write().await = Some(report);
        let (_, _, json) = request(&app, "GET", "/api/priorities", None).await;
        assert!(json["entries"].as_array().unwrap().is_empty());
        assert!(json["generated_at"].is_string());
    }

    #[tokio::test]
    async fn spa_fallback_serves_index_with_asset_caching() {
        let app = app(false);
        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/some/spa/route")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));

        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/app.js")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        assert!(response.headers()[header::CACHE_CONTROL]
            .to_str()
            .unwrap()
            .contains("immutable"));
    }

    #[tokio::test]
    async fn dev_mode_omits_the_bundle() {
        let app = app(true);
        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/some/spa/route")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
