// HTTP route handlers for the gavel dispatcher

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use gavel_common::rpc::{
    CreateJobRequest, CreateJobResponse, DispatchOutcome, ErrorBody, FinishJobRequest,
    FinishJobResponse, GetEvalsQuery, GetEvalsResponse, ReadJobResponse, RegisterEvalRequest,
    SearchFilter, SearchJobResponse, EVAL_NAME_HEADER,
};
use gavel_common::types::JobState;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;
use crate::store::StoreError;
use crate::AppState;

fn parse_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("invalid job uuid"))
}

/// POST /jobs - Job.Create
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(mut job) = payload.job else {
        return Err(ApiError::bad_request("job is required"));
    };
    if payload.priority <= 0 {
        return Err(ApiError::bad_request("priority must be positive"));
    }
    let required = [
        ("dataset_id", job.dataset_id.is_empty()),
        ("code", job.code.is_empty()),
        ("language", job.language.is_empty()),
        ("submission_id", job.submission_id.is_empty()),
        ("task_id", job.task_id.is_empty()),
    ];
    if let Some((field, _)) = required.iter().find(|(_, missing)| *missing) {
        return Err(ApiError::bad_request(format!("{} is required", field)));
    }

    job.state = JobState::Waiting;
    job.eval_id = String::new();
    job.result = None;
    job.finished_at = None;
    job.created_at = Utc::now();

    let uuid = state.store.create_job(&job).await?;
    let queue_id = state.store.enqueue_job(payload.priority, &uuid).await?;
    job.uuid = uuid;
    metrics::JOBS_CREATED.inc();
    info!(
        job_uuid = %uuid,
        queue_id,
        priority = payload.priority,
        language = %job.language,
        "Job queued"
    );

    if let Err(e) = state.submissions.update(&job).await {
        error!(job_uuid = %uuid, error = %e, "Failed to push new job to submission service");
    }
    state.trigger.kick();

    Ok((StatusCode::CREATED, Json(CreateJobResponse { uuid })))
}

/// GET /jobs/:uuid - Job.Read
pub async fn read_job(
    State(state): State<Arc<AppState>>,
    Path(raw_uuid): Path<String>,
) -> Result<Json<ReadJobResponse>, ApiError> {
    let uuid = parse_uuid(&raw_uuid)?;
    let job = state.store.read_job(&uuid).await?;
    Ok(Json(ReadJobResponse { job }))
}

/// GET /jobs - Job.Search
pub async fn search_jobs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<SearchFilter>,
) -> Result<Json<SearchJobResponse>, ApiError> {
    let jobs = state.store.search_jobs(&filter).await?;
    Ok(Json(SearchJobResponse { jobs }))
}

/// POST /jobs/:uuid/finish - Job.Finish
///
/// Stores the result, forwards it to the submission service and hands the
/// caller its next job, if any.
pub async fn finish_job(
    State(state): State<Arc<AppState>>,
    Path(raw_uuid): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<FinishJobRequest>,
) -> Result<Json<FinishJobResponse>, ApiError> {
    let uuid = parse_uuid(&raw_uuid)?;
    let eval = headers
        .get(EVAL_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing X-Eval-Name header"))?
        .to_string();
    let Some(result) = payload.result else {
        return Err(ApiError::bad_request("result is required"));
    };

    let job = match state.store.finish_job(&uuid, &result).await {
        Ok(job) => job,
        Err(StoreError::Conflict(message)) => return Err(ApiError::bad_request(message)),
        Err(e) => return Err(e.into()),
    };
    metrics::JOBS_FINISHED.inc();
    info!(job_uuid = %uuid, eval = %eval, score = %result.score, "Job finished");

    if let Err(e) = state.submissions.update(&job).await {
        error!(job_uuid = %uuid, error = %e, "Failed to push result to submission service");
    }

    let next_job = state.dispatcher.next_for(&eval).await?;
    Ok(Json(FinishJobResponse { next_job }))
}

/// GET /meta/evals - Meta.GetEvals
pub async fn get_evals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GetEvalsQuery>,
) -> Json<GetEvalsResponse> {
    let health = state.dispatcher.health();
    let evals = if query.refresh {
        health.check().await
    } else {
        health.snapshot().await
    };
    Json(GetEvalsResponse { evals })
}

/// POST /meta/dispatch - Meta.DispatchNext
pub async fn dispatch_next(State(state): State<Arc<AppState>>) -> Json<DispatchOutcome> {
    Json(state.trigger.dispatch_now().await)
}

/// POST /registry/evals - eval node heartbeat
pub async fn register_eval(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterEvalRequest>,
) -> Result<StatusCode, ApiError> {
    if payload.id.is_empty() || payload.address.is_empty() {
        return Err(ApiError::bad_request("id and address are required"));
    }
    if payload.ttl_secs == 0 {
        return Err(ApiError::bad_request("ttl_secs must be positive"));
    }
    state
        .registry
        .register(&payload.id, &payload.address, Duration::from_secs(payload.ttl_secs));
    Ok(StatusCode::NO_CONTENT)
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn render_metrics() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
