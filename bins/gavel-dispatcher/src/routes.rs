use axum::{
    routing::{get, post},
    Router,
};
use gavel_common::rpc;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(rpc::JOBS_ROUTE, post(handlers::create_job).get(handlers::search_jobs))
        .route(rpc::JOB_ROUTE, get(handlers::read_job))
        .route(rpc::JOB_FINISH_ROUTE, post(handlers::finish_job))
        .route(rpc::EVALS_ROUTE, get(handlers::get_evals))
        .route(rpc::DISPATCH_ROUTE, post(handlers::dispatch_next))
        .route(rpc::REGISTER_ROUTE, post(handlers::register_eval))
        .route(rpc::METRICS_ROUTE, get(handlers::render_metrics))
        .route(rpc::STATUS_ROUTE, get(handlers::health_check))
}
