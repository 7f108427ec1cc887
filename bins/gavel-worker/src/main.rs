mod clients;
mod config;
mod handlers;
mod program;
mod routes;
mod worker;
#[cfg(test)]
mod worker_tests;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use gavel_common::client::{CoreClient, DispatcherClient};
use gavel_common::logging;
use gavel_common::rpc::RegisterEvalRequest;
use gavel_sandbox::platform_factory;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::{LanguageConfigManager, WorkerConfig};
use crate::worker::{NodeIdentity, Worker};

pub struct AppState {
    pub worker: Arc<Worker>,
    /// Address reported in the node status
    pub advertise: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::parse();
    logging::init_tracing(config.debug, config.log_json);

    let identity = NodeIdentity {
        name: config.node_name(),
        description: config.description.clone(),
    };
    info!(name = %identity.name, box_id = config.box_id, "Gavel eval node booting...");

    let languages = LanguageConfigManager::load_or_default(&config.languages)
        .context("Failed to load language configuration")?;
    info!(languages = ?languages.list_languages(), "Loaded language configuration");

    let storage = CoreClient::new(config.core_url.clone(), config.rpc_timeout())
        .context("Failed to build core client")?;
    let dispatcher = DispatcherClient::new(config.dispatcher_url.clone(), config.rpc_timeout())
        .context("Failed to build dispatcher client")?;

    let worker = Arc::new(Worker::new(
        identity.clone(),
        config.box_id,
        Arc::new(languages),
        platform_factory(),
        Arc::new(storage),
        Arc::new(dispatcher.clone()),
    ));

    let advertise = config.advertise_address();
    let registration = RegisterEvalRequest {
        id: identity.name.clone(),
        address: advertise.clone(),
        ttl_secs: config.register_ttl,
    };
    let heartbeat = tokio::spawn(heartbeat(dispatcher, registration, config.register_interval()));

    let state = Arc::new(AppState { worker, advertise });
    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;
    info!("HTTP server listening on {}", config.listen);
    info!(dispatcher = %config.dispatcher_url, "Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    heartbeat.abort();
    info!("Eval node shut down");
    Ok(())
}

/// Keep this node's registration alive in the dispatcher's registry.
async fn heartbeat(dispatcher: DispatcherClient, request: RegisterEvalRequest, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    let mut registered = false;
    loop {
        ticker.tick().await;
        match dispatcher.register_eval(&request).await {
            Ok(()) if registered => debug!("Registration renewed"),
            Ok(()) => {
                info!(id = %request.id, address = %request.address, "Registered with dispatcher");
                registered = true;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register with dispatcher");
                registered = false;
            }
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
