//! Job and queue persistence.
//!
//! **Queue model:** a queue item is never deleted. Dequeuing inserts a
//! tombstone row sharing the item's id, so "the next item" is the highest
//! priority item without a tombstone. Both the peek and the dequeue run under
//! an exclusive lock on the queue and tombstone tables.
//!
//! **State model:** a job only moves forward along
//! WAITING < PROCESSING < DONE. The one exception is `rollback_job`, used by
//! the dispatcher when a hand-off it started fails.

mod sqlite;


pub use sqlite::SqliteStore;

use async_trait::async_trait;
use gavel_common::rpc::SearchFilter;
use gavel_common::types::{Job, JobResult, JobState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An entry of the dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub priority: i32,
    pub job_uuid: Uuid,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a new job and return its uuid. A nil uuid gets a fresh one.
    async fn create_job(&self, job: &Job) -> Result<Uuid>;

    async fn read_job(&self, uuid: &Uuid) -> Result<Job>;

    async fn search_jobs(&self, filter: &SearchFilter) -> Result<Vec<Job>>;

    /// Append a queue item for an existing job and return the item id.
    async fn enqueue_job(&self, priority: i32, job_uuid: &Uuid) -> Result<i64>;

    /// The next unconsumed item, without consuming it.
    async fn first_in_queue(&self) -> Result<QueueItem>;

    /// The next unconsumed item, consumed. Concurrent callers never get the
    /// same item.
    async fn dequeue_job(&self) -> Result<QueueItem>;

    /// Move the job forward to `state` and record `eval_id`. A state that is
    /// not strictly greater than the stored one leaves the row untouched.
    /// Returns whether the job advanced.
    async fn set_job_state_and_eval_id(&self, uuid: &Uuid, state: JobState, eval_id: &str) -> Result<bool>;

    /// Record the result, mark the job DONE and stamp `finished_at`. A job
    /// that is already DONE is left untouched and reported as `Conflict`.
    async fn finish_job(&self, uuid: &Uuid, result: &JobResult) -> Result<Job>;

    async fn is_finished(&self, uuid: &Uuid) -> Result<bool>;

    /// Conditional WAITING -> PROCESSING for `eval_id`. Only one concurrent
    /// claimant wins.
    async fn claim_job(&self, uuid: &Uuid, eval_id: &str) -> Result<bool>;

    /// PROCESSING -> WAITING, only while the job is still held by `eval_id`.
    async fn rollback_job(&self, uuid: &Uuid, eval_id: &str) -> Result<bool>;

    /// Tombstone a specific item. Returns false if it was already consumed.
    async fn consume_queue_item(&self, id: i64) -> Result<bool>;

    /// Re-enqueue the item's job under a new item if `item` has been
    /// consumed. Returns the new item id.
    async fn requeue_if_consumed(&self, item: &QueueItem) -> Result<Option<i64>>;
}
