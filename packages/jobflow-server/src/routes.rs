//! HTTP routes.
//!
//! ```text
//! POST /api/jobs                  trigger a pipeline (body: job definition)
//! GET  /api/jobs                  ?parent_id=root|<id>&status=a,b&job_type=t
//! GET  /api/jobs/:id
//! POST /api/jobs/:id/cancel
//! POST /api/jobs/:id/rerun
//! GET  /api/jobs/:id/logs         ?level=info
//! GET  /api/streams/:topic        SSE; topics "jobs" and "job:<pipeline id>"
//! GET  /health
//! ```

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, StreamExt};
use jobflow::hub::ALL_JOBS_TOPIC;
use jobflow::{
    Engine, Job, JobDefinition, JobFilter, JobId, JobStatus, JobflowError, LogEntry, LogLevel,
    ParentFilter, StoreError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Build the axum application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .route("/api/jobs/:id/rerun", post(rerun_job))
        .route("/api/jobs/:id/logs", get(job_logs))
        .route("/api/streams/:topic", get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Engine(JobflowError),
}

impl From<JobflowError> for ApiError {
    fn from(e: JobflowError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) => match e {
                JobflowError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                JobflowError::Definition(_)
                | JobflowError::UnknownWorkerType(_)
                | JobflowError::InvalidPayload { .. }
                | JobflowError::NotAPipeline(_)
                | JobflowError::MissingSnapshot(_) => StatusCode::UNPROCESSABLE_ENTITY,
                JobflowError::InvalidTransition { .. } | JobflowError::ParentTerminal { .. } => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Engine(e) => e.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %message, "request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Jobs
// ============================================================================

#[derive(Serialize)]
pub struct CreatedResponse {
    job_id: JobId,
}

async fn create_job(
    State(state): State<AppState>,
    Json(definition): Json<JobDefinition>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let job_id = state.engine.trigger(&definition).await?;
    Ok((StatusCode::ACCEPTED, Json(CreatedResponse { job_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    parent_id: Option<String>,
    /// Comma-separated statuses
    status: Option<String>,
    job_type: Option<String>,
}

impl ListQuery {
    fn into_filter(self) -> ApiResult<JobFilter> {
        let parent = match self.parent_id.as_deref() {
            Some(raw) => raw
                .parse::<ParentFilter>()
                .map_err(|e| ApiError::BadRequest(format!("invalid parent_id: {e}")))?,
            None => ParentFilter::Any,
        };
        let statuses = self
            .status
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<JobStatus>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ApiError::BadRequest)?;

        Ok(JobFilter {
            parent,
            statuses,
            job_type: self.job_type.filter(|t| !t.is_empty()),
        })
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let filter = query.into_filter()?;
    Ok(Json(state.engine.list_jobs(&filter).await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<Json<Job>> {
    Ok(Json(state.engine.get_job(id).await?))
}

#[derive(Serialize)]
pub struct CancelResponse {
    cancelled: Vec<JobId>,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.engine.cancel_job(id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn rerun_job(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let job_id = state.engine.rerun_job(id).await?;
    Ok((StatusCode::ACCEPTED, Json(CreatedResponse { job_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    level: Option<String>,
}

async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let min_level = query
        .level
        .as_deref()
        .map(str::parse::<LogLevel>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.engine.job_logs(id, min_level).await?))
}

// ============================================================================
// Streams
// ============================================================================

/// Checks that `topic` is one the gateway publishes to.
fn validate_topic(topic: &str) -> ApiResult<()> {
    if topic == ALL_JOBS_TOPIC {
        return Ok(());
    }
    match topic.strip_prefix("job:") {
        Some(id) => id
            .parse::<JobId>()
            .map(|_| ())
            .map_err(|_| ApiError::BadRequest(format!("invalid job id in topic: {id}"))),
        None => Err(ApiError::BadRequest(format!("unknown topic: {topic}"))),
    }
}

/// Subscribes to a hub topic and forwards each event as SSE, named after its
/// `type`.
async fn stream_handler(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> ApiResult<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>> {
    validate_topic(&topic)?;
    let rx = state.engine.hub().subscribe(&topic).await;

    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().event("connected").data("ok")) });

    let events = BroadcastStream::new(rx).filter_map(|result| async {
        match result {
            Ok(value) => {
                let event_name = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("message");
                Event::default()
                    .event(event_name)
                    .json_data(&value)
                    .ok()
                    .map(Ok)
            }
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                Event::default()
                    .event("lagged")
                    .json_data(json!({ "missed": n }))
                    .ok()
                    .map(Ok)
            }
        }
    });

    Ok(Sse::new(connected.chain(events)).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    stream_topics: usize,
}

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let stream_topics = state.engine.hub().topic_count().await;
    if state.engine.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "shutting_down",
                stream_topics,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            stream_topics,
        }),
    )
}
