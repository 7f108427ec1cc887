// Pipeline tests. Programs are shell scripts "compiled" with cp, and the
// sandbox runs them directly on the host.

use crate::clients::{JobReporter, Storage};
use crate::config::LanguageConfigManager;
use crate::worker::{aggregate_score, parse_score, NodeIdentity, Worker, WALL_GRACE};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use gavel_common::languages::LanguageConfig;
use gavel_common::types::{Dataset, Grader, Job, JobResult, JobState, Task, TestCase};
use gavel_sandbox::{BoxConfig, RawStatus, RunResult, RunStreams, Runner, RunnerFactory};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

const DOUBLE: &str = "read x\necho $((x * 2))\n";
const GRADER: &str = r#"if [ "$(cat "$2")" = "$(cat "$3")" ]; then
  echo 1.00
else
  echo 0.00
  echo 'wrong answer' >&2
fi
"#;

fn shell(name: &str, compile: &[&str]) -> LanguageConfig {
    LanguageConfig {
        name: name.to_string(),
        extension: "sh".to_string(),
        compile: compile.iter().map(|s| s.to_string()).collect(),
        version: vec!["echo".to_string(), "sh test toolchain".to_string()],
        execute: vec!["sh".to_string(), "{executable}".to_string()],
        env: BTreeMap::new(),
    }
}

fn languages() -> LanguageConfigManager {
    LanguageConfigManager::new(vec![
        shell("sh", &["cp", "{source}", "{executable}"]),
        shell("broken", &["sh", "-c", "echo boom >&2; exit 1", "{source}"]),
    ])
}

/// Runs `sh <command>` inside a plain directory standing in for the box.
struct HostRunner {
    dir: PathBuf,
    memory_limit: u64,
    inits: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
}

#[async_trait]
impl Runner for HostRunner {
    async fn init(&mut self) -> gavel_sandbox::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(self.dir.clone())
    }

    async fn run(&mut self, streams: RunStreams, command: &str, args: &[String]) -> gavel_sandbox::Result<RunResult> {
        let stdin = streams.stdin.map(Stdio::from).unwrap_or_else(Stdio::null);
        let stderr = streams.stderr.map(Stdio::from).unwrap_or_else(Stdio::null);
        let status = std::process::Command::new("sh")
            .arg(command)
            .args(args)
            .current_dir(&self.dir)
            .stdin(stdin)
            .stdout(Stdio::from(streams.stdout))
            .stderr(stderr)
            .status()?;
        let raw = match status.code() {
            Some(code) => RawStatus::Exited(code),
            None => RawStatus::Signaled(status.signal().unwrap_or(9)),
        };
        Ok(RunResult::from_status(
            raw,
            Duration::from_millis(3),
            Duration::from_millis(4),
            1024,
            self.memory_limit,
        ))
    }

    async fn cleanup(&mut self) -> gavel_sandbox::Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct HostSandboxes {
    root: TempDir,
    inits: Arc<AtomicUsize>,
    cleanups: Arc<AtomicUsize>,
    configs: Mutex<Vec<BoxConfig>>,
}

impl HostSandboxes {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            inits: Arc::default(),
            cleanups: Arc::default(),
            configs: Mutex::new(Vec::new()),
        }
    }
}

impl RunnerFactory for HostSandboxes {
    fn build(&self, box_id: u32, config: BoxConfig) -> Box<dyn Runner> {
        let runner = HostRunner {
            dir: self.root.path().join(format!("box{}", box_id)),
            memory_limit: config.memory_limit,
            inits: self.inits.clone(),
            cleanups: self.cleanups.clone(),
        };
        self.configs.lock().unwrap().push(config);
        Box::new(runner)
    }
}

struct FakeStorage {
    task: Task,
    grader_language: String,
    tests: Vec<TestCase>,
    attachments: HashMap<String, Vec<u8>>,
    gate: Option<Arc<Notify>>,
}

impl FakeStorage {
    /// A dataset whose test `n` (1-based) feeds `input` and expects `expected`.
    fn new(tests: &[(&str, &str)]) -> Self {
        let mut attachments = HashMap::new();
        attachments.insert("grader-src".to_string(), GRADER.as_bytes().to_vec());
        let mut cases = Vec::new();
        for (i, (input, expected)) in tests.iter().enumerate() {
            let number = i as i32 + 1;
            attachments.insert(format!("in{}", number), input.as_bytes().to_vec());
            attachments.insert(format!("ok{}", number), expected.as_bytes().to_vec());
            cases.push(TestCase {
                id: format!("tc{}", number),
                number,
                input_attachment_id: format!("in{}", number),
                output_attachment_id: format!("ok{}", number),
            });
        }
        // out of order on purpose
        cases.reverse();
        Self {
            task: task("stdin", "stdout"),
            grader_language: "sh".to_string(),
            tests: cases,
            attachments,
            gate: None,
        }
    }

    fn with_task(mut self, input_file: &str, output_file: &str) -> Self {
        self.task = task(input_file, output_file);
        self
    }
}

fn task(input_file: &str, output_file: &str) -> Task {
    Task {
        id: "t-1".to_string(),
        dataset_id: "ds-1".to_string(),
        name: "double".to_string(),
        title: "Double it".to_string(),
        input_file: input_file.to_string(),
        output_file: output_file.to_string(),
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn dataset(&self, id: &str) -> Result<Dataset> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(Dataset {
            id: id.to_string(),
            name: "main".to_string(),
            grader_id: "g-1".to_string(),
            description: String::new(),
            time_limit_ms: 1000,
            memory_limit: 65536,
        })
    }

    async fn task(&self, _id: &str) -> Result<Task> {
        Ok(self.task.clone())
    }

    async fn grader(&self, id: &str) -> Result<Grader> {
        Ok(Grader {
            id: id.to_string(),
            attachment_id: "grader-src".to_string(),
            language: self.grader_language.clone(),
            name: "exact".to_string(),
        })
    }

    async fn test_cases(&self, _dataset_id: &str) -> Result<Vec<TestCase>> {
        Ok(self.tests.clone())
    }

    async fn attachment(&self, id: &str) -> Result<Vec<u8>> {
        self.attachments
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no attachment {}", id))
    }
}

#[derive(Default)]
struct FakeReporter {
    finished: Mutex<Vec<(Uuid, String, JobResult)>>,
    next: Mutex<VecDeque<Job>>,
    unreachable: AtomicBool,
}

impl FakeReporter {
    fn results(&self) -> Vec<(Uuid, String, JobResult)> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobReporter for FakeReporter {
    async fn finish(&self, uuid: &Uuid, eval_name: &str, result: JobResult) -> Result<Option<Job>> {
        self.finished
            .lock()
            .unwrap()
            .push((*uuid, eval_name.to_string(), result));
        if self.unreachable.load(Ordering::SeqCst) {
            anyhow::bail!("dispatcher unreachable");
        }
        Ok(self.next.lock().unwrap().pop_front())
    }
}

struct Rig {
    worker: Arc<Worker>,
    reporter: Arc<FakeReporter>,
    sandboxes: Arc<HostSandboxes>,
}

fn rig(storage: FakeStorage) -> Rig {
    let reporter = Arc::new(FakeReporter::default());
    let sandboxes = Arc::new(HostSandboxes::new());
    let worker = Arc::new(Worker::new(
        NodeIdentity {
            name: "eval-test".to_string(),
            description: "test node".to_string(),
        },
        3,
        Arc::new(languages()),
        sandboxes.clone(),
        Arc::new(storage),
        reporter.clone(),
    ));
    Rig {
        worker,
        reporter,
        sandboxes,
    }
}

fn job(language: &str, code: &str) -> Job {
    Job {
        uuid: Uuid::new_v4(),
        dataset_id: "ds-1".to_string(),
        code: code.as_bytes().to_vec(),
        language: language.to_string(),
        eval_id: "eval-test".to_string(),
        state: JobState::Processing,
        submission_id: "sub-1".to_string(),
        task_id: "t-1".to_string(),
        created_at: Utc::now(),
        finished_at: None,
        result: None,
    }
}

async fn run_job(rig: &Rig, job: Job) -> JobResult {
    rig.worker.work(job).unwrap().await.unwrap();
    rig.reporter.results().pop().unwrap().2
}

#[test]
fn test_parse_score_reads_first_line() {
    assert_eq!(parse_score("0.75\nextra\n"), Decimal::new(75, 2));
    assert_eq!(parse_score("  1 \n"), Decimal::ONE);
    assert_eq!(parse_score("accepted\n").to_string(), "0.00");
    assert_eq!(parse_score("").to_string(), "0.00");
}

#[test]
fn test_aggregate_score() {
    assert_eq!(aggregate_score(Decimal::new(100, 2), 2).to_string(), "50.00");
    assert_eq!(aggregate_score(Decimal::new(400, 2), 4).to_string(), "100.00");
    assert_eq!(aggregate_score(Decimal::ONE, 3).to_string(), "33.33");
    assert_eq!(aggregate_score(Decimal::ZERO, 0).to_string(), "0.00");
}

#[tokio::test]
async fn test_one_of_two_passing_scores_fifty() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n"), ("3\n", "7\n")]));
    let job = job("sh", DOUBLE);
    let uuid = job.uuid;
    let result = run_job(&rig, job).await;

    assert_eq!(result.error_message, "");
    assert_eq!(result.score.to_string(), "50.00");
    assert_eq!(result.test_results.len(), 2);
    assert_eq!(result.test_results[0].test_no, 1);
    assert_eq!(result.test_results[0].score, Decimal::new(100, 2));
    assert_eq!(result.test_results[0].memory, 1024);
    assert_eq!(result.test_results[0].time_ms, 3);
    assert_eq!(result.test_results[1].score, Decimal::ZERO);
    assert_eq!(result.test_results[1].grader_message, "wrong answer");
    assert!(result.build_command.starts_with("cp "));
    assert!(result.build_command.ends_with("/userprogram"));
    assert!(result.compilation_message.starts_with("sh test toolchain\n"));

    let finished = rig.reporter.results();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].0, uuid);
    assert_eq!(finished[0].1, "eval-test");
    assert!(rig.worker.is_idle());
}

#[tokio::test]
async fn test_all_passing_scores_hundred() {
    let tests = [("1\n", "2\n"), ("2\n", "4\n"), ("5\n", "10\n"), ("0\n", "0\n")];
    let rig = rig(FakeStorage::new(&tests));
    let result = run_job(&rig, job("sh", DOUBLE)).await;
    assert_eq!(result.score.to_string(), "100.00");
    assert_eq!(result.test_results.len(), 4);
}

#[tokio::test]
async fn test_sandbox_is_fresh_per_test_and_workspace_removed() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n"), ("3\n", "6\n")]));
    let result = run_job(&rig, job("sh", DOUBLE)).await;

    assert_eq!(rig.sandboxes.inits.load(Ordering::SeqCst), 2);
    assert_eq!(rig.sandboxes.cleanups.load(Ordering::SeqCst), 2);
    let config = rig.sandboxes.configs.lock().unwrap()[0].clone();
    assert_eq!(config.cpu_time, Duration::from_millis(1000));
    assert_eq!(config.wall_time, Duration::from_millis(1000) + WALL_GRACE);
    assert_eq!(config.memory_limit, 65536);

    let executable = PathBuf::from(result.build_command.rsplit(' ').next().unwrap());
    assert!(!executable.parent().unwrap().exists());
}

#[tokio::test]
async fn test_compile_failure_skips_tests() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n")]));
    let result = run_job(&rig, job("broken", DOUBLE)).await;

    assert!(result.error_message.starts_with("err_userprogram_compilation:"));
    assert!(result.compilation_message.contains("boom"));
    assert!(result.test_results.is_empty());
    assert_eq!(result.score.to_string(), "0.00");
    assert_eq!(rig.sandboxes.inits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_grader_compile_failure() {
    let mut storage = FakeStorage::new(&[("2\n", "4\n")]);
    storage.grader_language = "broken".to_string();
    let rig = rig(storage);
    let result = run_job(&rig, job("sh", DOUBLE)).await;

    assert!(result.error_message.starts_with("err_grader_compilation:sh -c"));
    assert!(result.error_message.contains("boom"));
    assert!(result.test_results.is_empty());
}

#[tokio::test]
async fn test_unknown_language_fails_prepare() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n")]));
    let result = run_job(&rig, job("cobol", DOUBLE)).await;
    assert!(result.error_message.starts_with("err_prepare:"));
    assert!(result.error_message.contains("cobol"));
    assert!(rig.worker.is_idle());
}

#[tokio::test]
async fn test_runtime_error_is_not_graded() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n")]));
    let result = run_job(&rig, job("sh", "exit 3\n")).await;

    assert_eq!(result.error_message, "");
    assert_eq!(result.test_results.len(), 1);
    assert_eq!(result.test_results[0].grader_message, "Program exited with exit status 3");
    assert_eq!(result.test_results[0].score.to_string(), "0.00");
    assert_eq!(result.score.to_string(), "0.00");
}

#[tokio::test]
async fn test_killed_program_reports_signal() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n")]));
    let result = run_job(&rig, job("sh", "kill -9 $$\n")).await;
    assert_eq!(result.test_results[0].grader_message, "Killed by signal 9: killed");
}

#[tokio::test]
async fn test_file_based_io() {
    let storage = FakeStorage::new(&[("21\n", "42\n")]).with_task("input.txt", "output.txt");
    let rig = rig(storage);
    let code = "read x < input.txt\necho $((x * 2)) > output.txt\n";
    let result = run_job(&rig, job("sh", code)).await;
    assert_eq!(result.error_message, "");
    assert_eq!(result.score.to_string(), "100.00");
}

#[tokio::test]
async fn test_missing_output_file() {
    let storage = FakeStorage::new(&[("21\n", "42\n")]).with_task("input.txt", "output.txt");
    let rig = rig(storage);
    let result = run_job(&rig, job("sh", "true\n")).await;
    assert_eq!(result.error_message, "err_no_output_file:output.txt");
    assert!(result.test_results.is_empty());
    assert_eq!(rig.sandboxes.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_no_test_cases_scores_zero() {
    let rig = rig(FakeStorage::new(&[]));
    let result = run_job(&rig, job("sh", DOUBLE)).await;
    assert_eq!(result.error_message, "");
    assert_eq!(result.score.to_string(), "0.00");
    assert!(result.test_results.is_empty());
}

#[tokio::test]
async fn test_only_one_job_at_a_time() {
    let gate = Arc::new(Notify::new());
    let mut storage = FakeStorage::new(&[("2\n", "4\n")]);
    storage.gate = Some(gate.clone());
    let rig = rig(storage);

    let handle = rig.worker.work(job("sh", DOUBLE)).unwrap();
    assert!(!rig.worker.is_idle());
    let err = rig.worker.work(job("sh", DOUBLE)).unwrap_err();
    assert!(err.to_string().contains("not idle"));
    assert!(!rig.worker.status().idle);

    gate.notify_one();
    handle.await.unwrap();
    assert!(rig.worker.is_idle());
    assert_eq!(rig.reporter.results().len(), 1);
}

#[tokio::test]
async fn test_next_job_from_finish_is_run() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n")]));
    let first = job("sh", DOUBLE);
    let second = job("sh", "echo 5\n");
    let (first_uuid, second_uuid) = (first.uuid, second.uuid);
    rig.reporter.next.lock().unwrap().push_back(second);

    rig.worker.work(first).unwrap().await.unwrap();

    let finished = rig.reporter.results();
    assert_eq!(finished.len(), 2);
    assert_eq!(finished[0].0, first_uuid);
    assert_eq!(finished[0].2.score.to_string(), "100.00");
    assert_eq!(finished[1].0, second_uuid);
    assert_eq!(finished[1].2.score.to_string(), "0.00");
    assert!(rig.worker.is_idle());
}

#[tokio::test]
async fn test_failed_report_still_cleans_up_and_idles() {
    let rig = rig(FakeStorage::new(&[("2\n", "4\n")]));
    rig.reporter.unreachable.store(true, Ordering::SeqCst);
    rig.reporter.next.lock().unwrap().push_back(job("sh", DOUBLE));

    let result = run_job(&rig, job("sh", DOUBLE)).await;
    assert_eq!(result.score.to_string(), "100.00");
    assert_eq!(rig.sandboxes.cleanups.load(Ordering::SeqCst), 1);
    let executable = PathBuf::from(result.build_command.rsplit(' ').next().unwrap());
    assert!(!executable.parent().unwrap().exists());
    assert!(rig.worker.is_idle());
    // a failed report hands over no next job
    assert_eq!(rig.reporter.next.lock().unwrap().len(), 1);

    rig.reporter.unreachable.store(false, Ordering::SeqCst);
    rig.reporter.next.lock().unwrap().clear();
    let handle = rig.worker.work(job("sh", DOUBLE)).unwrap();
    handle.await.unwrap();
    assert_eq!(rig.reporter.results().len(), 2);
    assert!(rig.worker.is_idle());
}

#[tokio::test]
async fn test_status_reflects_disabled_flag() {
    let rig = rig(FakeStorage::new(&[]));
    let status = rig.worker.status();
    assert_eq!(status.name, "eval-test");
    assert_eq!(status.description, "test node");
    assert!(status.idle);
    assert!(!status.disabled);

    rig.worker.set_disabled(true);
    assert!(rig.worker.status().disabled);
    assert!(!rig.worker.status().is_available());
}
