//! Matching queued jobs to idle eval nodes.
//!
//! Dispatch is not serialized: two passes can peek the same item. The
//! conditional WAITING -> PROCESSING claim picks one winner; the loser
//! reports `Conflict`. A hand-off that the node refuses is rolled back and
//! the next node is tried. If every node refuses and the item was consumed
//! meanwhile, the job is re-enqueued so it can't be lost.

use crate::clients::{EvalClient, SubmissionClient};
use crate::health::HealthTracker;
use crate::metrics;
use crate::store::{QueueItem, Store, StoreError};
use gavel_common::rpc::DispatchOutcome;
use gavel_common::types::{Job, JobState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    health: Arc<HealthTracker>,
    client: Arc<dyn EvalClient>,
    submissions: Arc<dyn SubmissionClient>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        health: Arc<HealthTracker>,
        client: Arc<dyn EvalClient>,
        submissions: Arc<dyn SubmissionClient>,
    ) -> Self {
        Self {
            store,
            health,
            client,
            submissions,
        }
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// One dispatch attempt for the head of the queue.
    pub async fn dispatch_next(&self) -> DispatchOutcome {
        let outcome = match self.try_dispatch().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Dispatch failed");
                DispatchOutcome::Failed { reason: e.to_string() }
            }
        };
        metrics::record_dispatch(&outcome);
        outcome
    }

    async fn try_dispatch(&self) -> Result<DispatchOutcome, StoreError> {
        // One health pass per attempt, also when the queue turns out empty.
        let candidates: Vec<_> = self
            .health
            .check()
            .await
            .into_iter()
            .filter(|node| node.is_available())
            .collect();

        let item = match self.store.first_in_queue().await {
            Ok(item) => item,
            Err(StoreError::NotFound) => return Ok(DispatchOutcome::QueueEmpty),
            Err(e) => return Err(e),
        };
        let job_uuid = item.job_uuid;

        if candidates.is_empty() {
            debug!(job_uuid = %job_uuid, "No idle eval node");
            return Ok(DispatchOutcome::NoIdleNode { job_uuid });
        }

        let mut job = self.store.read_job(&job_uuid).await?;
        for node in candidates {
            let eval = node.eval_name().to_string();
            if !self.store.claim_job(&job_uuid, &eval).await? {
                return self.conflict(&item).await;
            }
            job.state = JobState::Processing;
            job.eval_id = eval.clone();

            match self.client.assign(&node.address, &job).await {
                Ok(()) => {
                    self.store.consume_queue_item(item.id).await?;
                    info!(job_uuid = %job_uuid, eval = %eval, node_id = %node.id, "Dispatched job");
                    self.report(&job).await;
                    return Ok(DispatchOutcome::Dispatched { job_uuid, eval });
                }
                Err(e) => {
                    warn!(job_uuid = %job_uuid, eval = %eval, error = %e, "Eval node refused job");
                    if !self.store.rollback_job(&job_uuid, &eval).await? {
                        return self.conflict(&item).await;
                    }
                }
            }
        }

        if let Some(queue_id) = self.store.requeue_if_consumed(&item).await? {
            debug!(job_uuid = %job_uuid, queue_id, "Job put back in queue");
        }
        Ok(DispatchOutcome::NoIdleNode { job_uuid })
    }

    /// Someone else moved the job out of WAITING, so the item is stale.
    async fn conflict(&self, item: &QueueItem) -> Result<DispatchOutcome, StoreError> {
        self.store.consume_queue_item(item.id).await?;
        debug!(job_uuid = %item.job_uuid, queue_id = item.id, "Job was claimed elsewhere");
        Ok(DispatchOutcome::Conflict {
            job_uuid: item.job_uuid,
        })
    }

    /// Dequeue the next job and claim it for `eval`. Items whose job is
    /// already claimed elsewhere are skipped.
    pub async fn next_for(&self, eval: &str) -> Result<Option<Job>, StoreError> {
        loop {
            let item = match self.store.dequeue_job().await {
                Ok(item) => item,
                Err(StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            };
            if self.store.claim_job(&item.job_uuid, eval).await? {
                let job = self.store.read_job(&item.job_uuid).await?;
                info!(job_uuid = %job.uuid, eval, "Handing next job to finishing eval node");
                self.report(&job).await;
                return Ok(Some(job));
            }
            debug!(job_uuid = %item.job_uuid, "Skipping already claimed job");
        }
    }

    /// Push the job's new state to the submission service. Failures are only
    /// logged.
    async fn report(&self, job: &Job) {
        if let Err(e) = self.submissions.update(job).await {
            error!(job_uuid = %job.uuid, error = %e, "Failed to push job state to submission service");
        }
    }

    /// Dispatch until the queue is empty or no node takes the head.
    pub async fn drain(&self) {
        loop {
            match self.dispatch_next().await {
                DispatchOutcome::Dispatched { .. } | DispatchOutcome::Conflict { .. } => continue,
                _ => break,
            }
        }
    }
}

enum Trigger {
    Kick,
    Await(oneshot::Sender<DispatchOutcome>),
}

/// Handle for waking the dispatch loop.
#[derive(Clone)]
pub struct DispatchTrigger {
    tx: mpsc::Sender<Trigger>,
}

impl DispatchTrigger {
    /// Ask for a drain pass. A full channel already has one pending.
    pub fn kick(&self) {
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.tx.try_send(Trigger::Kick) {
            warn!("Dispatch loop is gone, dropping trigger");
        }
    }

    /// Run one dispatch attempt on the loop and wait for its outcome.
    pub async fn dispatch_now(&self) -> DispatchOutcome {
        let (reply, outcome) = oneshot::channel();
        if self.tx.send(Trigger::Await(reply)).await.is_err() {
            return DispatchOutcome::Failed {
                reason: "dispatch loop is not running".to_string(),
            };
        }
        outcome.await.unwrap_or_else(|_| DispatchOutcome::Failed {
            reason: "dispatch loop dropped the request".to_string(),
        })
    }
}

/// The single owner of periodic and triggered dispatch passes.
pub struct DispatchLoop {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    rx: mpsc::Receiver<Trigger>,
}

impl DispatchLoop {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration, capacity: usize) -> (Self, DispatchTrigger) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                dispatcher,
                interval,
                rx,
            },
            DispatchTrigger { tx },
        )
    }

    /// Runs until every `DispatchTrigger` is dropped. The first tick fires
    /// immediately, which doubles as the startup pass. Every dispatch attempt
    /// starts with a health pass, so a tick over an empty queue still polls
    /// the fleet exactly once.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => self.dispatcher.drain().await,
                trigger = self.rx.recv() => match trigger {
                    Some(Trigger::Kick) => self.dispatcher.drain().await,
                    Some(Trigger::Await(reply)) => {
                        let outcome = self.dispatcher.dispatch_next().await;
                        let dispatched = matches!(outcome, DispatchOutcome::Dispatched { .. });
                        let _ = reply.send(outcome);
                        if dispatched {
                            self.dispatcher.drain().await;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("Dispatch loop stopped");
    }
}
