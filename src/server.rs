//! HTTP API over [`CaptureService`].
//!
//! | Route | |
//! |---|---|
//! | `POST /capture` | submit a job, `202` with the new session |
//! | `GET /capture?sessionId=` | poll a session |
//! | `DELETE /capture?sessionId=` | cancel a running job |
//! | `GET /download?sessionId=` | zip archive of a completed session |
//! | `GET /captures` | every known session, without thumbnails |
//! | `GET /health` | health snapshot |
//! | `GET /metrics` | Prometheus exposition, when a recorder is installed |

use crate::health::{self, HealthReport};
use crate::service::{CaptureService, ProgressView};
use crate::session::Session;
use crate::{CaptureError, CaptureMode, CaptureRequest, SessionStatus};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CaptureService>,
    /// Render handle of the installed Prometheus recorder
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(service: Arc<CaptureService>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            service,
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/capture",
            get(status_handler)
                .post(submit_handler)
                .delete(cancel_handler),
        )
        .route("/download", get(download_handler))
        .route("/captures", get(list_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Binds `bind` and serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, bind: &str, shutdown: F) -> Result<(), CaptureError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// A [`CaptureError`] on its way out of a handler. Only
/// [`CaptureError::user_message`] reaches the client.
#[derive(Debug)]
pub struct ApiError(CaptureError);

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CaptureError::InvalidUrl(_) | CaptureError::InvalidOptions(_) => {
                StatusCode::BAD_REQUEST
            }
            CaptureError::SessionNotFound(_) | CaptureError::ArchiveMissing(_) => {
                StatusCode::NOT_FOUND
            }
            CaptureError::InvalidTransition { .. } | CaptureError::ArchiveNotReady(_) => {
                StatusCode::CONFLICT
            }
            CaptureError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted {
    session_id: String,
    status: SessionStatus,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<ProgressView>,
}

/// One row of `GET /captures`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionListing {
    session_id: String,
    status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<CaptureMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl From<Session> for SessionListing {
    fn from(session: Session) -> Self {
        let (base_url, mode, total_pages) = match session.result {
            Some(result) => (
                Some(result.base_url),
                Some(result.mode),
                Some(result.total_pages),
            ),
            None => (None, None, None),
        };
        Self {
            session_id: session.session_id,
            status: session.status,
            base_url,
            mode,
            total_pages,
            error: session.error,
            created_at: session.created_at,
            finished_at: session.finished_at,
        }
    }
}

/// POST /capture
async fn submit_handler(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let session = state.service.submit(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            session_id: session.session_id,
            status: session.status,
        }),
    ))
}

/// GET /capture
async fn status_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let session = state
        .service
        .status(&query.session_id)
        .await?
        .ok_or_else(|| CaptureError::SessionNotFound(query.session_id.clone()))?;

    let progress = if session.status == SessionStatus::Processing {
        state.service.progress(&query.session_id)
    } else {
        None
    };
    Ok(Json(StatusResponse { session, progress }))
}

/// DELETE /capture
async fn cancel_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.service.cancel(&query.session_id).await?))
}

/// GET /download
async fn download_handler(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
    let (filename, bytes) = state.service.archive(&query.session_id).await?;
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, bytes).into_response())
}

/// GET /captures
async fn list_handler(State(state): State<AppState>) -> Json<Vec<SessionListing>> {
    let mut sessions = state.service.list().await;
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(sessions.into_iter().map(SessionListing::from).collect())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(health::health_check(
        state.start_time,
        state.service.pool_stats(),
        state.service.running_jobs(),
        state.service.cached_sessions(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
