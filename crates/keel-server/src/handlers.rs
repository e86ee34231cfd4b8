use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{sse::Event as SseEvent, sse::KeepAlive, IntoResponse, Response, Sse},
    middleware,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use keel_common::{JobStatus, WeightInstallRequest};
use keel_control::jobs::JobFilter;
use keel_control::{ControlError, ErrorKind, HistoryFilter};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

const SSE_BACKLOG: usize = 64;

/// Maps control errors onto status codes with a `{"error": ...}` body.
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_status(raw: Option<&str>) -> ApiResult<Option<JobStatus>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s
            .parse::<JobStatus>()
            .map(Some)
            .map_err(|e| ApiError::from(ControlError::invalid(e))),
        None => Ok(None),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteBody {
    candidate_id: String,
    expected_current: Option<String>,
    requested_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    job_type: Option<String>,
    model_id: Option<String>,
    #[serde(default)]
    limit: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    event: Option<String>,
    model_id: Option<String>,
    #[serde(default)]
    limit: usize,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn status(State(st): State<AppState>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.status().await?).into_response())
}

pub async fn list_models(State(st): State<AppState>, Query(q): Query<CatalogQuery>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.catalog(q.refresh).await?).into_response())
}

pub async fn get_model(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.get_model(&id).await?).into_response())
}

pub async fn refresh_catalog(State(st): State<AppState>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.refresh_catalog(true).await?).into_response())
}

pub async fn activate(
    State(st): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<Requester>>,
) -> ApiResult<Response> {
    let requester = body.map(|Json(b)| b).unwrap_or_default();
    let activation = st
        .coordinator
        .activate(&id, requester.requested_by.as_deref())
        .await?;
    Ok(Json(activation).into_response())
}

pub async fn dry_run(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.dry_run(&id).await?).into_response())
}

pub async fn promote(State(st): State<AppState>, Json(body): Json<PromoteBody>) -> ApiResult<Response> {
    let promotion = st
        .coordinator
        .promote(
            &body.candidate_id,
            body.expected_current.as_deref(),
            body.requested_by.as_deref(),
        )
        .await?;
    Ok(Json(promotion).into_response())
}

pub async fn deactivate(State(st): State<AppState>, body: Option<Json<Requester>>) -> ApiResult<Response> {
    let requester = body.map(|Json(b)| b).unwrap_or_default();
    let result = st.coordinator.deactivate(requester.requested_by.as_deref()).await?;
    Ok(Json(result).into_response())
}

pub async fn get_active(State(st): State<AppState>) -> ApiResult<Response> {
    Ok(Json(json!({ "active": st.coordinator.get_active().await? })).into_response())
}

pub async fn validate_model(
    State(st): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> ApiResult<Response> {
    Ok(Json(st.coordinator.validate_model(raw).await?).into_response())
}

pub async fn install_weights(
    State(st): State<AppState>,
    Json(request): Json<WeightInstallRequest>,
) -> ApiResult<Response> {
    let submission = st.coordinator.install_weights(request).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)).into_response())
}

pub async fn list_weights(State(st): State<AppState>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.list_weights().await?).into_response())
}

pub async fn get_weights(State(st): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.get_weights(&name).await?).into_response())
}

pub async fn delete_weights(State(st): State<AppState>, Path(name): Path<String>) -> ApiResult<Response> {
    st.coordinator.delete_weights(&name).await?;
    Ok(Json(json!({ "deleted": name })).into_response())
}

pub async fn list_jobs(State(st): State<AppState>, Query(q): Query<JobsQuery>) -> ApiResult<Response> {
    let filter = JobFilter {
        status: parse_status(q.status.as_deref())?,
        job_type: q.job_type.filter(|s| !s.is_empty()),
        model_id: q.model_id,
        limit: q.limit,
    };
    Ok(Json(st.coordinator.list_jobs(&filter).await?).into_response())
}

pub async fn delete_jobs(State(st): State<AppState>, Query(q): Query<StatusQuery>) -> ApiResult<Response> {
    let status = parse_status(q.status.as_deref())?;
    let deleted = st.coordinator.delete_jobs(status).await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

pub async fn get_job(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.get_job(&id).await?).into_response())
}

pub async fn job_logs(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.job_logs(&id).await?).into_response())
}

pub async fn cancel_job(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    Ok(Json(st.coordinator.cancel_job(&id).await?).into_response())
}

pub async fn retry_job(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let submission = st.coordinator.retry_job(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)).into_response())
}

pub async fn list_history(State(st): State<AppState>, Query(q): Query<HistoryQuery>) -> ApiResult<Response> {
    let filter = HistoryFilter {
        event: q.event,
        model_id: q.model_id,
        limit: q.limit,
    };
    Ok(Json(st.coordinator.list_history(&filter).await?).into_response())
}

pub async fn clear_history(State(st): State<AppState>) -> ApiResult<Response> {
    let deleted = st.coordinator.clear_history().await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

/// Seeded job snapshots followed by live events. The forwarder stops as soon
/// as the client goes away, which drops the subscription.
pub async fn events(State(st): State<AppState>) -> ApiResult<Response> {
    let mut stream = st.coordinator.subscribe().await?;
    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(SSE_BACKLOG);
    let metrics = st.metrics.clone();
    let connection = metrics.track_sse_connection();

    tokio::spawn(async move {
        let _connection = connection;
        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                ev = stream.next() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            let data = match serde_json::to_string(&event) {
                Ok(d) => d,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "failed to encode event");
                    continue;
                }
            };
            metrics.observe_sse_event(&event.kind);
            let frame = SseEvent::default().id(event.id).event(event.kind).data(data);
            if tx.send(Ok(frame)).await.is_err() {
                break;
            }
        }
        debug!("event stream closed");
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

pub fn router(st: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/models", get(list_models))
        .route("/models/validate", post(validate_model))
        .route("/models/:id", get(get_model))
        .route("/models/:id/activate", post(activate))
        .route("/models/:id/dry-run", post(dry_run))
        .route("/catalog/refresh", post(refresh_catalog))
        .route("/promote", post(promote))
        .route("/deactivate", post(deactivate))
        .route("/active", get(get_active))
        .route("/weights", get(list_weights))
        .route("/weights/install", post(install_weights))
        .route("/weights/*name", get(get_weights).delete(delete_weights))
        .route("/jobs", get(list_jobs).delete(delete_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/logs", get(job_logs))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/history", get(list_history).delete(clear_history))
        .route("/events", get(events))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use keel_control::activation::{ActivationEngine, ManifestBuilder, MemoryDeploymentClient};
    use keel_control::catalog::{CatalogManager, DirCatalogSource};
    use keel_control::{Capabilities, Coordinator, EventBus, StateStore};
    use keel_meta::MemoryKvStore;
    use tower::ServiceExt;

    fn app(catalog_dir: &std::path::Path) -> Router {
        let models = catalog_dir.join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(
            models.join("qwen.json"),
            r#"{"id":"qwen","hfModelId":"Qwen/Qwen2.5-7B-Instruct"}"#,
        )
        .unwrap();
        std::fs::write(models.join("llama.json"), r#"{"id":"llama","hfModelId":"meta/llama"}"#).unwrap();

        let store = StateStore::new(Arc::new(MemoryKvStore::new()));
        let catalog = CatalogManager::new(
            Arc::new(DirCatalogSource::new(catalog_dir, "models")),
            Some(store.clone()),
            Duration::from_secs(30),
        );
        let activation = ActivationEngine::new(
            Arc::new(MemoryDeploymentClient::new("active-llm")),
            ManifestBuilder::new("ai", "active-llm"),
        );
        let coordinator = Coordinator::new(
            catalog,
            activation,
            store,
            EventBus::new(16),
            Capabilities::default(),
            5,
        );
        router(AppState::new(Arc::new(coordinator)))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_healthz() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        let (status, body) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_models_listing_and_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());

        let (status, body) = call(&app, "GET", "/models", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "live");
        assert_eq!(body["models"].as_array().unwrap().len(), 2);

        let (status, body) = call(&app, "GET", "/models/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_activate_then_promote_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());

        let (status, body) = call(
            &app,
            "POST",
            "/models/qwen/activate",
            Some(json!({"requestedBy": "ops"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["action"], "created");

        let (_, body) = call(&app, "GET", "/active", None).await;
        assert_eq!(body["active"]["metadata"]["annotations"]["keel/model-id"], "qwen");

        let (status, _) = call(
            &app,
            "POST",
            "/promote",
            Some(json!({"candidateId": "llama", "expectedCurrent": "other"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            "POST",
            "/promote",
            Some(json!({"candidateId": "llama", "expectedCurrent": "qwen"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["previousModelId"], "qwen");

        let (_, body) = call(&app, "GET", "/history?event=model_activated", None).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deactivate_without_body() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        let (status, body) = call(&app, "POST", "/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "already_deleted");
    }

    #[tokio::test]
    async fn test_disabled_features_are_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        let (status, body) = call(&app, "POST", "/weights/install", Some(json!({"modelId": "a/b"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().starts_with("feature disabled"));

        let (status, _) = call(&app, "GET", "/weights/org/model", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_count_requests_and_catalog_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        call(&app, "GET", "/models", None).await;
        call(&app, "GET", "/models/missing", None).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("keel_requests_total 2\n"), "{text}");
        assert!(text.contains("keel_responses_4xx 1\n"));
        assert!(text.contains("keel_catalog_refresh_total{status=\"success\"} 1\n"));
        assert!(text.contains("keel_catalog_models 2\n"));
        assert!(text.contains("keel_sse_connections 0\n"));
        // weight installs are disabled in this app
        assert!(!text.contains("keel_job_status_total"));
        assert!(!text.contains("keel_job_queue_depth"));
    }

    #[tokio::test]
    async fn test_unknown_job_status_filter_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app(tmp.path());
        let (status, _) = call(&app, "GET", "/jobs?status=exploded", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
