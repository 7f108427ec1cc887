//! RPC routing semantics shared by servers and clients, so the two never
//! drift apart.

use crate::types::{Job, JobResult, JobState, NodeInfo};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header a worker sets on `Job.Finish` so the dispatcher knows whom to hand
/// the next queued job to.
pub const EVAL_NAME_HEADER: &str = "x-eval-name";

// Dispatcher routes
pub const JOBS_ROUTE: &str = "/jobs";
pub const JOB_ROUTE: &str = "/jobs/:uuid";
pub const JOB_FINISH_ROUTE: &str = "/jobs/:uuid/finish";
pub const EVALS_ROUTE: &str = "/meta/evals";
pub const DISPATCH_ROUTE: &str = "/meta/dispatch";
pub const REGISTER_ROUTE: &str = "/registry/evals";
pub const METRICS_ROUTE: &str = "/metrics";
pub const STATUS_ROUTE: &str = "/status";

// Eval node routes
pub const ASSIGN_ROUTE: &str = "/assign";
pub const DISABLED_ROUTE: &str = "/disabled";

pub fn job_path(uuid: &Uuid) -> String {
    format!("{}/{}", JOBS_ROUTE, uuid)
}

pub fn finish_path(uuid: &Uuid) -> String {
    format!("{}/{}/finish", JOBS_ROUTE, uuid)
}

/// Join a base URL (with or without scheme) and a route.
pub fn url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{}{}", base, path)
    } else {
        format!("http://{}{}", base, path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub priority: i32,
    pub job: Option<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadJobResponse {
    pub job: Job,
}

/// Job.Search filter. Every field that is set narrows the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    pub task_id: Option<String>,
    pub dataset_id: Option<String>,
    pub language: Option<String>,
    pub eval_id: Option<String>,
    pub state: Option<JobState>,
    /// Case-insensitive substring of the job's error message
    pub error_message: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchJobResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishJobRequest {
    pub result: Option<JobResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FinishJobResponse {
    pub next_job: Option<Job>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetEvalsQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEvalsResponse {
    pub evals: Vec<NodeInfo>,
}

/// Result of one pass of the dispatch routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched { job_uuid: Uuid, eval: String },
    QueueEmpty,
    NoIdleNode { job_uuid: Uuid },
    /// Another dispatch attempt claimed the job first.
    Conflict { job_uuid: Uuid },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterEvalRequest {
    pub id: String,
    pub address: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    pub job: Option<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStatusResponse {
    pub info: NodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDisabledRequest {
    pub disabled: bool,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// Core storage service routes consumed by the worker and dispatcher.
pub mod core_api {
    pub fn dataset_path(id: &str) -> String {
        format!("/datasets/{}", id)
    }

    pub fn test_cases_path(dataset_id: &str) -> String {
        format!("/datasets/{}/test_cases", dataset_id)
    }

    pub fn task_path(id: &str) -> String {
        format!("/tasks/{}", id)
    }

    pub fn grader_path(id: &str) -> String {
        format!("/graders/{}", id)
    }

    pub fn attachment_contents_path(id: &str) -> String {
        format!("/attachments/{}/contents", id)
    }

    pub const SUBMISSION_UPDATE_PATH: &str = "/submissions/update";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentContents {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionUpdateRequest {
    pub job: Job,
}
