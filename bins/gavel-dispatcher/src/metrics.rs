// Prometheus metrics for the dispatcher, exposed on /metrics.

use gavel_common::rpc::DispatchOutcome;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref JOBS_CREATED: IntCounter =
        register_int_counter!("gavel_jobs_created_total", "Jobs accepted by Job.Create")
            .expect("metric can be registered");
    pub static ref JOBS_FINISHED: IntCounter =
        register_int_counter!("gavel_jobs_finished_total", "Jobs reported through Job.Finish")
            .expect("metric can be registered");
    pub static ref DISPATCH_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "gavel_dispatch_outcomes_total",
        "Dispatch attempts by outcome",
        &["outcome"]
    )
    .expect("metric can be registered");
    pub static ref ALIVE_NODES: IntGauge =
        register_int_gauge!("gavel_eval_nodes_alive", "Eval nodes in the health table")
            .expect("metric can be registered");
    pub static ref IDLE_NODES: IntGauge =
        register_int_gauge!("gavel_eval_nodes_idle", "Alive eval nodes that are idle and enabled")
            .expect("metric can be registered");
    pub static ref HEALTH_POLL_FAILURES: IntCounter =
        register_int_counter!("gavel_health_poll_failures_total", "Failed or timed out status polls")
            .expect("metric can be registered");
}

pub fn outcome_label(outcome: &DispatchOutcome) -> &'static str {
    match outcome {
        DispatchOutcome::Dispatched { .. } => "dispatched",
        DispatchOutcome::QueueEmpty => "queue_empty",
        DispatchOutcome::NoIdleNode { .. } => "no_idle_node",
        DispatchOutcome::Conflict { .. } => "conflict",
        DispatchOutcome::Failed { .. } => "failed",
    }
}

pub fn record_dispatch(outcome: &DispatchOutcome) {
    DISPATCH_OUTCOMES.with_label_values(&[outcome_label(outcome)]).inc();
}

/// Render the default registry in the text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
