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
        .route(rpc::ASSIGN_ROUTE, post(handlers::assign))
        .route(rpc::STATUS_ROUTE, get(handlers::status))
        .route(rpc::DISABLED_ROUTE, post(handlers::set_disabled))
}
