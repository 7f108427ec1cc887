use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of a job. Ordering matters: the store only ever moves a job
/// forward along WAITING < PROCESSING < DONE, apart from the dispatcher's
/// explicit hand-off rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Waiting,
    Processing,
    Done,
}

impl JobState {
    pub fn as_i64(self) -> i64 {
        match self {
            JobState::Waiting => 0,
            JobState::Processing => 1,
            JobState::Done => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(JobState::Waiting),
            1 => Some(JobState::Processing),
            2 => Some(JobState::Done),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "WAITING",
            JobState::Processing => "PROCESSING",
            JobState::Done => "DONE",
        };
        write!(f, "{}", s)
    }
}

/// One grading request for a submission against a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub uuid: Uuid,
    pub dataset_id: String,
    #[serde(with = "code_base64")]
    pub code: Vec<u8>,
    pub language: String,
    #[serde(default)]
    pub eval_id: String,
    #[serde(default)]
    pub state: JobState,
    pub submission_id: String,
    pub task_id: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<JobResult>,
}

/// Outcome of grading a job, overall and per test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub compilation_message: String,
    pub score: Decimal,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
}

impl Default for JobResult {
    fn default() -> Self {
        Self {
            error_message: String::new(),
            compilation_message: String::new(),
            score: zero_score(),
            build_command: String::new(),
            test_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_no: i32,
    pub score: Decimal,
    #[serde(default)]
    pub grader_message: String,
    /// Peak memory in KiB
    pub memory: u64,
    /// CPU time in milliseconds
    pub time_ms: u64,
}

impl TestResult {
    pub fn new(test_no: i32) -> Self {
        Self {
            test_no,
            score: zero_score(),
            grader_message: String::new(),
            memory: 0,
            time_ms: 0,
        }
    }
}

/// `0.00`, the score every test and job starts from.
pub fn zero_score() -> Decimal {
    Decimal::new(0, 2)
}

/// Status of an eval node as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub address: String,
    pub idle: bool,
    pub disabled: bool,
}

impl NodeInfo {
    pub fn is_available(&self) -> bool {
        self.idle && !self.disabled
    }

    /// The name the node reports itself under, which is what it sends back
    /// on Finish. Falls back to the registry id.
    pub fn eval_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub grader_id: String,
    #[serde(default)]
    pub description: String,
    pub time_limit_ms: u64,
    /// Memory limit in KiB
    pub memory_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    /// File name the program reads from, or `stdin`
    pub input_file: String,
    /// File name the program writes to, or `stdout`
    pub output_file: String,
}

impl Task {
    pub fn reads_stdin(&self) -> bool {
        self.input_file == STDIN
    }

    pub fn writes_stdout(&self) -> bool {
        self.output_file == STDOUT
    }
}

pub const STDIN: &str = "stdin";
pub const STDOUT: &str = "stdout";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grader {
    pub id: String,
    pub attachment_id: String,
    pub language: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub id: String,
    pub number: i32,
    pub input_attachment_id: String,
    pub output_attachment_id: String,
}

mod code_base64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(code: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(code))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
