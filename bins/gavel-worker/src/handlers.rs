use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gavel_common::rpc::{AssignRequest, ErrorBody, GetStatusResponse, SetDisabledRequest};
use std::sync::Arc;
use tracing::{debug, info};

use crate::AppState;

/// An RPC the node refuses. Every refusal is the caller's problem, so it is
/// always a 400.
#[derive(Debug)]
pub struct Rejected(String);

impl IntoResponse for Rejected {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(ErrorBody { error: self.0 })).into_response()
    }
}

/// Eval.Assign: start a job if the node is enabled and idle.
pub async fn assign(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AssignRequest>,
) -> Result<StatusCode, Rejected> {
    if state.worker.is_disabled() {
        return Err(Rejected("node is disabled".to_string()));
    }
    let job = request.job.ok_or_else(|| Rejected("invalid job".to_string()))?;
    let uuid = job.uuid;
    state
        .worker
        .work(job)
        .map_err(|e| Rejected(e.to_string()))?;
    info!(job_uuid = %uuid, "Accepted job");
    Ok(StatusCode::ACCEPTED)
}

/// Eval.GetStatus
pub async fn status(State(state): State<Arc<AppState>>) -> Json<GetStatusResponse> {
    let mut info = state.worker.status();
    info.address = state.advertise.clone();
    debug!(idle = info.idle, disabled = info.disabled, "Status requested");
    Json(GetStatusResponse { info })
}

/// Eval.SetDisabled. A running job is left to finish.
pub async fn set_disabled(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetDisabledRequest>,
) -> StatusCode {
    state.worker.set_disabled(request.disabled);
    StatusCode::NO_CONTENT
}
