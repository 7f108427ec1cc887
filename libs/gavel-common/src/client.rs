//! HTTP clients for the dispatcher, eval node and core storage RPCs.
//! Route and body definitions come from `rpc`, so callers and servers
//! never drift apart.

use crate::rpc::{
    self, core_api, AssignRequest, AttachmentContents, CreateJobRequest, CreateJobResponse,
    DispatchOutcome, ErrorBody, FinishJobRequest, FinishJobResponse, GetEvalsResponse,
    GetStatusResponse, ReadJobResponse, RegisterEvalRequest, SearchFilter, SearchJobResponse,
    SetDisabledRequest, SubmissionUpdateRequest,
};
use crate::types::{Dataset, Grader, Job, JobResult, NodeInfo, Task, TestCase};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

impl RpcError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RpcError::Status { status, .. } => Some(*status),
            RpcError::Transport(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Turn a non-2xx response into `RpcError::Status`, unwrapping `ErrorBody`
/// when the server sent one.
async fn check(response: Response) -> RpcResult<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);
    Err(RpcError::Status { status, message })
}

async fn json<T: DeserializeOwned>(response: Response) -> RpcResult<T> {
    Ok(check(response).await?.json().await?)
}

fn build_http(timeout: Duration) -> RpcResult<Client> {
    Ok(Client::builder().timeout(timeout).build()?)
}

/// Client for the dispatcher's `Job.*` and `Meta.*` surface.
#[derive(Debug, Clone)]
pub struct DispatcherClient {
    http: Client,
    base_url: String,
}

impl DispatcherClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        rpc::url(&self.base_url, path)
    }

    pub async fn create_job(&self, priority: i32, job: Job) -> RpcResult<Uuid> {
        let request = CreateJobRequest {
            priority,
            job: Some(job),
        };
        let response = self
            .http
            .post(self.url(rpc::JOBS_ROUTE))
            .json(&request)
            .send()
            .await?;
        let body: CreateJobResponse = json(response).await?;
        Ok(body.uuid)
    }

    pub async fn read_job(&self, uuid: &Uuid) -> RpcResult<Job> {
        let response = self.http.get(self.url(&rpc::job_path(uuid))).send().await?;
        let body: ReadJobResponse = json(response).await?;
        Ok(body.job)
    }

    pub async fn search_jobs(&self, filter: &SearchFilter) -> RpcResult<Vec<Job>> {
        let response = self
            .http
            .get(self.url(rpc::JOBS_ROUTE))
            .query(filter)
            .send()
            .await?;
        let body: SearchJobResponse = json(response).await?;
        Ok(body.jobs)
    }

    /// Report a finished job. Returns the next job assigned to `eval_name`, if any.
    pub async fn finish_job(&self, uuid: &Uuid, eval_name: &str, result: JobResult) -> RpcResult<Option<Job>> {
        let response = self
            .http
            .post(self.url(&rpc::finish_path(uuid)))
            .header(rpc::EVAL_NAME_HEADER, eval_name)
            .json(&FinishJobRequest { result: Some(result) })
            .send()
            .await?;
        let body: FinishJobResponse = json(response).await?;
        Ok(body.next_job)
    }

    pub async fn get_evals(&self, refresh: bool) -> RpcResult<Vec<NodeInfo>> {
        let response = self
            .http
            .get(self.url(rpc::EVALS_ROUTE))
            .query(&[("refresh", refresh)])
            .send()
            .await?;
        let body: GetEvalsResponse = json(response).await?;
        Ok(body.evals)
    }

    pub async fn dispatch_next(&self) -> RpcResult<DispatchOutcome> {
        let response = self.http.post(self.url(rpc::DISPATCH_ROUTE)).send().await?;
        json(response).await
    }

    pub async fn register_eval(&self, request: &RegisterEvalRequest) -> RpcResult<()> {
        let response = self
            .http
            .post(self.url(rpc::REGISTER_ROUTE))
            .json(request)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Client for an eval node's `Eval.*` surface. Addresses are per call.
#[derive(Debug, Clone)]
pub struct EvalNodeClient {
    http: Client,
}

impl EvalNodeClient {
    pub fn new(timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            http: build_http(timeout)?,
        })
    }

    pub async fn status(&self, address: &str) -> RpcResult<NodeInfo> {
        let response = self
            .http
            .get(rpc::url(address, rpc::STATUS_ROUTE))
            .send()
            .await?;
        let body: GetStatusResponse = json(response).await?;
        Ok(body.info)
    }

    pub async fn assign(&self, address: &str, job: &Job) -> RpcResult<()> {
        let response = self
            .http
            .post(rpc::url(address, rpc::ASSIGN_ROUTE))
            .json(&AssignRequest {
                job: Some(job.clone()),
            })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn set_disabled(&self, address: &str, disabled: bool) -> RpcResult<()> {
        let response = self
            .http
            .post(rpc::url(address, rpc::DISABLED_ROUTE))
            .json(&SetDisabledRequest { disabled })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// Client for the core storage and submission service.
#[derive(Debug, Clone)]
pub struct CoreClient {
    http: Client,
    base_url: String,
}

impl CoreClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RpcResult<Self> {
        Ok(Self {
            http: build_http(timeout)?,
            base_url: base_url.into(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RpcResult<T> {
        let response = self.http.get(rpc::url(&self.base_url, path)).send().await?;
        json(response).await
    }

    pub async fn dataset(&self, id: &str) -> RpcResult<Dataset> {
        self.get(&core_api::dataset_path(id)).await
    }

    pub async fn test_cases(&self, dataset_id: &str) -> RpcResult<Vec<TestCase>> {
        self.get(&core_api::test_cases_path(dataset_id)).await
    }

    pub async fn task(&self, id: &str) -> RpcResult<Task> {
        self.get(&core_api::task_path(id)).await
    }

    pub async fn grader(&self, id: &str) -> RpcResult<Grader> {
        self.get(&core_api::grader_path(id)).await
    }

    /// Location the attachment's bytes can be downloaded from.
    pub async fn attachment_url(&self, id: &str) -> RpcResult<String> {
        let body: AttachmentContents = self.get(&core_api::attachment_contents_path(id)).await?;
        Ok(body.url)
    }

    pub async fn download(&self, url: &str) -> RpcResult<Vec<u8>> {
        let response = check(self.http.get(url).send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn update_submission(&self, job: &Job) -> RpcResult<()> {
        let response = self
            .http
            .post(rpc::url(&self.base_url, core_api::SUBMISSION_UPDATE_PATH))
            .json(&SubmissionUpdateRequest { job: job.clone() })
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}
