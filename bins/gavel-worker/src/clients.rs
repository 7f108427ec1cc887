// Collaborators of the worker pipeline: the core service for job inputs and
// the dispatcher for reporting results.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gavel_common::client::{CoreClient, DispatcherClient};
use gavel_common::types::{Dataset, Grader, Job, JobResult, Task, TestCase};
use uuid::Uuid;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn dataset(&self, id: &str) -> Result<Dataset>;
    async fn task(&self, id: &str) -> Result<Task>;
    async fn grader(&self, id: &str) -> Result<Grader>;
    async fn test_cases(&self, dataset_id: &str) -> Result<Vec<TestCase>>;
    /// Contents of an attachment.
    async fn attachment(&self, id: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl Storage for CoreClient {
    async fn dataset(&self, id: &str) -> Result<Dataset> {
        CoreClient::dataset(self, id)
            .await
            .with_context(|| format!("couldn't get dataset {}", id))
    }

    async fn task(&self, id: &str) -> Result<Task> {
        CoreClient::task(self, id)
            .await
            .with_context(|| format!("couldn't get task {}", id))
    }

    async fn grader(&self, id: &str) -> Result<Grader> {
        CoreClient::grader(self, id)
            .await
            .with_context(|| format!("couldn't get grader {}", id))
    }

    async fn test_cases(&self, dataset_id: &str) -> Result<Vec<TestCase>> {
        CoreClient::test_cases(self, dataset_id)
            .await
            .with_context(|| format!("couldn't get dataset's {} test cases", dataset_id))
    }

    async fn attachment(&self, id: &str) -> Result<Vec<u8>> {
        let url = self
            .attachment_url(id)
            .await
            .with_context(|| format!("couldn't get attachment {} contents", id))?;
        self.download(&url)
            .await
            .with_context(|| format!("couldn't download attachment from {}", url))
    }
}

/// Receives finished results. May hand back the next job to run.
#[async_trait]
pub trait JobReporter: Send + Sync {
    async fn finish(&self, uuid: &Uuid, eval_name: &str, result: JobResult) -> Result<Option<Job>>;
}

#[async_trait]
impl JobReporter for DispatcherClient {
    async fn finish(&self, uuid: &Uuid, eval_name: &str, result: JobResult) -> Result<Option<Job>> {
        self.finish_job(uuid, eval_name, result)
            .await
            .with_context(|| format!("couldn't finish job {}", uuid))
    }
}
