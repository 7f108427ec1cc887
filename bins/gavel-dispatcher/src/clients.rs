// Outbound RPC seams used by the health tracker, dispatcher and Finish handler.

use anyhow::Result;
use async_trait::async_trait;
use gavel_common::client::{CoreClient, EvalNodeClient};
use gavel_common::types::{Job, NodeInfo};
use tracing::debug;

#[async_trait]
pub trait EvalClient: Send + Sync {
    async fn status(&self, address: &str) -> Result<NodeInfo>;
    async fn assign(&self, address: &str, job: &Job) -> Result<()>;
}

#[async_trait]
impl EvalClient for EvalNodeClient {
    async fn status(&self, address: &str) -> Result<NodeInfo> {
        Ok(EvalNodeClient::status(self, address).await?)
    }

    async fn assign(&self, address: &str, job: &Job) -> Result<()> {
        Ok(EvalNodeClient::assign(self, address, job).await?)
    }
}

/// Pushes job state and results to the submission-tracking service.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    async fn update(&self, job: &Job) -> Result<()>;
}

#[async_trait]
impl SubmissionClient for CoreClient {
    async fn update(&self, job: &Job) -> Result<()> {
        Ok(self.update_submission(job).await?)
    }
}

/// Used when no core service is configured.
pub struct NoSubmissions;

#[async_trait]
impl SubmissionClient for NoSubmissions {
    async fn update(&self, job: &Job) -> Result<()> {
        debug!(job_uuid = %job.uuid, "No submission service configured, skipping update");
        Ok(())
    }
}
