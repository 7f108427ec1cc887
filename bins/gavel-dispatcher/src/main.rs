mod clients;
mod config;
mod dispatch;
mod error;
mod handlers;
mod health;
mod metrics;
mod registry;
mod routes;
mod store;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use gavel_common::client::{CoreClient, EvalNodeClient};
use gavel_common::logging;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::clients::{NoSubmissions, SubmissionClient};
use crate::config::Config;
use crate::dispatch::{DispatchLoop, DispatchTrigger, Dispatcher};
use crate::health::HealthTracker;
use crate::registry::{MergedRegistry, RegisteredNode, Registry, StaticRegistry, TtlRegistry};
use crate::store::{SqliteStore, Store};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub trigger: DispatchTrigger,
    pub registry: Arc<TtlRegistry>,
    pub submissions: Arc<dyn SubmissionClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    logging::init_tracing(config.debug, config.log_json);

    info!("Gavel dispatcher booting...");

    let store = Arc::new(
        SqliteStore::connect(&config.database_url, config.max_connections)
            .await
            .context("Failed to open job store")?,
    );

    let static_nodes: Vec<RegisteredNode> = config
        .evals
        .iter()
        .filter_map(|entry| {
            let node = RegisteredNode::parse(entry);
            if node.is_none() {
                warn!(eval = %entry, "Ignoring malformed static eval node");
            }
            node
        })
        .collect();
    info!(count = static_nodes.len(), "Static eval nodes configured");

    let ttl_registry = Arc::new(TtlRegistry::new());
    let sources: Vec<Arc<dyn Registry>> = vec![
        Arc::new(StaticRegistry::new(static_nodes)),
        ttl_registry.clone(),
    ];
    let registry = Arc::new(MergedRegistry::new(sources));

    let evals = Arc::new(
        EvalNodeClient::new(config.assign_timeout()).context("Failed to build eval node client")?,
    );
    let health = Arc::new(HealthTracker::new(registry, evals.clone(), config.status_timeout()));
    let submissions: Arc<dyn SubmissionClient> = match &config.core_url {
        Some(url) => {
            info!(core_url = %url, "Submission updates enabled");
            Arc::new(CoreClient::new(url.clone(), config.assign_timeout()).context("Failed to build core client")?)
        }
        None => {
            warn!("No core URL configured, submission updates are disabled");
            Arc::new(NoSubmissions)
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), health, evals, submissions.clone()));

    let (dispatch_loop, trigger) = DispatchLoop::new(
        dispatcher.clone(),
        config.health_check_interval(),
        config.trigger_capacity,
    );
    let dispatch_task = tokio::spawn(dispatch_loop.run());

    let state = Arc::new(AppState {
        store,
        dispatcher,
        trigger,
        registry: ttl_registry,
        submissions,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;

    info!("HTTP server listening on {}", config.listen);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router held the last trigger, so the loop finishes its pass and exits.
    if let Err(e) = dispatch_task.await {
        error!(error = %e, "Dispatch loop panicked");
    }
    info!("Dispatcher shut down");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}
