//! JSON-over-HTTP surface for clients and workers.
//!
//! Payload and result bytes travel as JSON byte arrays and are never inspected.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::dispatcher::{Dispatcher, ServerStatus};
use crate::error::GridError;
use crate::scheduler::job::{
    ClientId, Job, JobId, JobResult, Outcome, PartitionKey, ServiceId, ServiceVersion, WorkerId,
};

#[derive(Deserialize)]
pub struct RegisterClientRequest {
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterClientResponse {
    pub client_id: ClientId,
}

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub service_id: ServiceId,
    pub service_version: ServiceVersion,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub client_id: Option<ClientId>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

#[derive(Deserialize)]
pub struct FetchJobRequest {
    pub service_id: ServiceId,
    pub service_version: ServiceVersion,
    pub worker_id: WorkerId,
}

#[derive(Deserialize)]
pub struct SubmitResultRequest {
    pub job_id: JobId,
    #[serde(default)]
    pub worker_id: Option<WorkerId>,
    pub outcome: Outcome,
}

#[derive(Deserialize)]
pub struct ExchangeRequest {
    pub service_id: ServiceId,
    pub service_version: ServiceVersion,
    pub worker_id: WorkerId,
    #[serde(default)]
    pub result: Option<JobResult>,
}

#[derive(Deserialize)]
pub struct FetchResultsQuery {
    pub max: Option<usize>,
    pub client_id: Option<ClientId>,
}

#[derive(Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub payload: Vec<u8>,
    pub retry_count: u32,
}

impl From<Job> for JobInfo {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            payload: job.payload,
            retry_count: job.retry_count,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job: Option<JobInfo>,
}

#[derive(Serialize, Deserialize)]
pub struct FetchResultsResponse {
    pub results: Vec<JobResult>,
}

/// `GridError` rendered as an HTTP response.
pub struct ApiError(GridError);

impl From<GridError> for ApiError {
    fn from(e: GridError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self.0 {
            GridError::InvalidPartition { .. } => "invalid_partition",
            GridError::UnknownJob(_) => "unknown_job",
            GridError::NotFound(_) => "not_found",
            GridError::NotAssigned(_) => "not_assigned",
            GridError::NotOwner { .. } => "not_owner",
            GridError::AlreadyAssigned(_) => "already_assigned",
            GridError::StateConflict { .. } => "state_conflict",
            GridError::IllegalTransition { .. } => "illegal_transition",
            GridError::QueueFull { .. } => "queue_full",
            GridError::UnknownClient(_) => "unknown_client",
            GridError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            GridError::InvalidPartition { .. } => StatusCode::BAD_REQUEST,
            GridError::UnknownJob(_) | GridError::NotFound(_) | GridError::UnknownClient(_) => {
                StatusCode::NOT_FOUND
            }
            GridError::NotAssigned(_)
            | GridError::NotOwner { .. }
            | GridError::AlreadyAssigned(_)
            | GridError::StateConflict { .. } => StatusCode::CONFLICT,
            GridError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GridError::IllegalTransition { .. } | GridError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "success": false,
            "kind": self.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/clients", post(register_client_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/fetch", post(fetch_job_handler))
        .route(
            "/api/results",
            post(submit_result_handler).get(fetch_results_handler),
        )
        .route("/api/exchange", post(exchange_handler))
        .route("/api/status", get(status_handler))
        .layer(cors)
        .with_state(dispatcher)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn run_http(
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting grid server");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn register_client_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<RegisterClientRequest>,
) -> Json<RegisterClientResponse> {
    let client_id = dispatcher.register_client(req.description).await;
    Json(RegisterClientResponse { client_id })
}

async fn submit_job_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<SubmitJobRequest>,
) -> ApiResult<SubmitJobResponse> {
    let key = PartitionKey::new(req.service_id, req.service_version);
    let job_id = dispatcher
        .submit_job(key, req.payload, req.client_id)
        .await?;
    Ok(Json(SubmitJobResponse { job_id }))
}

async fn fetch_job_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<FetchJobRequest>,
) -> ApiResult<JobEnvelope> {
    let key = PartitionKey::new(req.service_id, req.service_version);
    let job = dispatcher.fetch_job(key, &req.worker_id).await?;
    Ok(Json(JobEnvelope {
        job: job.map(JobInfo::from),
    }))
}

async fn submit_result_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<SubmitResultRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    dispatcher
        .submit_result(
            JobResult::new(req.job_id, req.outcome),
            req.worker_id.as_ref(),
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn exchange_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(req): Json<ExchangeRequest>,
) -> ApiResult<JobEnvelope> {
    let key = PartitionKey::new(req.service_id, req.service_version);
    let job = dispatcher.exchange(key, &req.worker_id, req.result).await?;
    Ok(Json(JobEnvelope {
        job: job.map(JobInfo::from),
    }))
}

async fn fetch_results_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<FetchResultsQuery>,
) -> ApiResult<FetchResultsResponse> {
    let results = dispatcher.fetch_results(query.client_id, query.max).await?;
    Ok(Json(FetchResultsResponse { results }))
}

async fn status_handler(State(dispatcher): State<Arc<Dispatcher>>) -> Json<ServerStatus> {
    Json(dispatcher.status().await)
}
