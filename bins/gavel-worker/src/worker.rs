//! The eval node's job pipeline.
//!
//! A job runs through prepare, one sandboxed run per test case, finish and
//! cleanup, in that order. Finish and cleanup always happen. Failures end up
//! in the job's result rather than escaping: prepare errors are reported as
//! `err_prepare:` and test loop errors as `err_system:`, unless a more
//! specific message was recorded first.
//!
//! At most one job is active. When the dispatcher answers a finish report
//! with another job, the worker starts on it without going idle.

use crate::clients::{JobReporter, Storage};
use crate::config::LanguageConfigManager;
use crate::program::{combined, Program};
use anyhow::{anyhow, bail, Context, Result};
use gavel_common::types::{zero_score, Dataset, Job, JobResult, NodeInfo, Task, TestResult};
use gavel_sandbox::{BoxConfig, Outcome, RunResult, RunStreams, RunnerFactory, Sandbox};
use rust_decimal::Decimal;
use std::fs::{File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Wall-clock allowance on top of the CPU time limit.
pub const WALL_GRACE: Duration = Duration::from_millis(250);

const USER_PROGRAM: &str = "userprogram";
const GRADER: &str = "grader";
const OUTPUT_FILE: &str = "userprogram.out";

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub name: String,
    pub description: String,
}

pub struct Worker {
    identity: NodeIdentity,
    box_id: u32,
    languages: Arc<LanguageConfigManager>,
    sandboxes: Arc<dyn RunnerFactory>,
    storage: Arc<dyn Storage>,
    reporter: Arc<dyn JobReporter>,
    active: Mutex<Option<Uuid>>,
    disabled: AtomicBool,
}

impl Worker {
    pub fn new(
        identity: NodeIdentity,
        box_id: u32,
        languages: Arc<LanguageConfigManager>,
        sandboxes: Arc<dyn RunnerFactory>,
        storage: Arc<dyn Storage>,
        reporter: Arc<dyn JobReporter>,
    ) -> Self {
        Self {
            identity,
            box_id,
            languages,
            sandboxes,
            storage,
            reporter,
            active: Mutex::new(None),
            disabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    fn active(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_idle(&self) -> bool {
        self.active().is_none()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
        if disabled {
            warn!("Node has been disabled!");
        } else {
            warn!("Node has been enabled!");
        }
    }

    pub fn status(&self) -> NodeInfo {
        NodeInfo {
            id: self.identity.name.clone(),
            name: self.identity.name.clone(),
            description: self.identity.description.clone(),
            address: String::new(),
            idle: self.is_idle(),
            disabled: self.is_disabled(),
        }
    }

    /// Take `job` if no other job is active and run it in the background.
    /// The handle completes once the worker is idle again.
    pub fn work(self: &Arc<Self>, job: Job) -> Result<JoinHandle<()>> {
        {
            let mut active = self.active();
            if let Some(current) = *active {
                bail!("worker is not idle, running job {}", current);
            }
            *active = Some(job.uuid);
        }
        let worker = Arc::clone(self);
        Ok(tokio::spawn(async move { worker.execute(job).await }))
    }

    async fn execute(self: Arc<Self>, mut job: Job) {
        loop {
            let uuid = job.uuid;
            info!(job_uuid = %uuid, language = %job.language, "Starting work");

            let mut run = JobRun::new(&self, &job);
            run.run().await;
            let result = std::mem::take(&mut run.result);
            let next = self.finish(&job, result).await;
            run.cleanup().await;
            info!(job_uuid = %uuid, "Work finished");

            match self.adopt(next) {
                Some(next) => job = next,
                None => break,
            }
        }
    }

    /// Report the result. Returns the job the dispatcher handed back, if any.
    async fn finish(&self, job: &Job, result: JobResult) -> Option<Job> {
        debug!(job_uuid = %job.uuid, score = %result.score, error = %result.error_message, "Reporting result");
        match self.reporter.finish(&job.uuid, self.name(), result).await {
            Ok(next) => {
                info!(job_uuid = %job.uuid, "Work done");
                next
            }
            Err(e) => {
                error!(job_uuid = %job.uuid, error = %format!("{:#}", e), "Failed to report result");
                None
            }
        }
    }

    fn adopt(&self, next: Option<Job>) -> Option<Job> {
        let mut active = self.active();
        match next {
            Some(next) => {
                info!(next_job = %next.uuid, "Next job");
                *active = Some(next.uuid);
                Some(next)
            }
            None => {
                *active = None;
                info!("No work left. Idling...");
                None
            }
        }
    }
}

/// Everything prepare produced for the test loop.
struct Prepared {
    dir: PathBuf,
    dataset: Dataset,
    task: Task,
    user: Program,
    grader: Program,
    tests: Vec<i32>,
}

/// State of one job attempt.
struct JobRun<'a> {
    worker: &'a Worker,
    job: &'a Job,
    result: JobResult,
    workspace: Option<TempDir>,
    sandbox: Option<Sandbox>,
}

impl<'a> JobRun<'a> {
    fn new(worker: &'a Worker, job: &'a Job) -> Self {
        Self {
            worker,
            job,
            result: JobResult::default(),
            workspace: None,
            sandbox: None,
        }
    }

    async fn run(&mut self) {
        match self.prepare().await {
            Err(e) => self.fail("err_prepare:", &e),
            Ok(prepared) => {
                if let Err(e) = self.run_tests(&prepared).await {
                    self.fail("err_system:", &e);
                }
            }
        }
    }

    fn fail(&mut self, prefix: &str, err: &anyhow::Error) {
        warn!(job_uuid = %self.job.uuid, error = %format!("{:#}", err), "Job attempt failed");
        if self.result.error_message.is_empty() {
            self.result.error_message = format!("{}{:#}", prefix, err);
        }
    }

    async fn prepare(&mut self) -> Result<Prepared> {
        let job = self.job;
        let worker = self.worker;
        let languages = &worker.languages;
        let storage = &worker.storage;

        let workspace = tempfile::Builder::new()
            .prefix(&format!("gavel-eval-w-{}-d{}", worker.name(), job.dataset_id))
            .tempdir()
            .context("couldn't create temp dir")?;
        let dir = workspace.path().to_path_buf();
        self.workspace = Some(workspace);
        debug!(temp_dir = %dir.display(), "Created temp dir");

        let user = Program::new(&dir, USER_PROGRAM, languages.get_config(&job.language)?.clone());
        tokio::fs::write(&user.source, &job.code)
            .await
            .context("couldn't write user program")?;

        let dataset = storage.dataset(&job.dataset_id).await?;
        let task = storage.task(&job.task_id).await?;

        let grader_meta = storage.grader(&dataset.grader_id).await?;
        let grader = Program::new(&dir, GRADER, languages.get_config(&grader_meta.language)?.clone());
        let source = storage.attachment(&grader_meta.attachment_id).await?;
        tokio::fs::write(&grader.source, source)
            .await
            .context("couldn't write grader")?;
        debug!(grader = %grader_meta.id, "Got grader");

        let mut test_cases = storage.test_cases(&job.dataset_id).await?;
        test_cases.sort_by_key(|tc| tc.number);
        for tc in &test_cases {
            let input = storage
                .attachment(&tc.input_attachment_id)
                .await
                .with_context(|| format!("couldn't get input #{} contents", tc.number))?;
            let expected = storage
                .attachment(&tc.output_attachment_id)
                .await
                .with_context(|| format!("couldn't get output #{} contents", tc.number))?;
            tokio::fs::write(test_path(&dir, tc.number, "in"), input)
                .await
                .context("couldn't write test input")?;
            tokio::fs::write(test_path(&dir, tc.number, "ok"), expected)
                .await
                .context("couldn't write test output")?;
        }
        debug!(count = test_cases.len(), "Downloaded tests");

        self.compile(&user, &grader).await?;

        Ok(Prepared {
            dir,
            dataset,
            task,
            user,
            grader,
            tests: test_cases.iter().map(|tc| tc.number).collect(),
        })
    }

    async fn compile(&mut self, user: &Program, grader: &Program) -> Result<()> {
        self.result.build_command = user.build_command();
        debug!(command = %self.result.build_command, "Compiling user program");
        let (output, failure) = build(user).await;
        let version = user.version().await;
        self.result.compilation_message = format!("{}\n{}", version, output);
        if let Some(reason) = failure {
            self.result.error_message = format!("err_userprogram_compilation:{}", reason);
            bail!("couldn't compile user program: {}", reason);
        }

        let command = grader.build_command();
        debug!(command = %command, "Compiling grader");
        let (output, failure) = build(grader).await;
        if let Some(reason) = failure {
            self.result.error_message = format!("err_grader_compilation:{}\n{}\n{}", command, output, reason);
            bail!("couldn't compile grader program: {}", reason);
        }
        Ok(())
    }

    async fn run_tests(&mut self, prepared: &Prepared) -> Result<()> {
        let task = &prepared.task;
        let output_path = prepared.dir.join(OUTPUT_FILE);
        let mut sum = Decimal::ZERO;

        for &number in &prepared.tests {
            let mut test = TestResult::new(number);
            let input = test_path(&prepared.dir, number, "in");
            let expected = test_path(&prepared.dir, number, "ok");

            let box_dir = self.init_sandbox(&prepared.dataset).await?;
            copy_file(&prepared.user.executable, &box_dir.join(USER_PROGRAM)).await?;
            let stdout = File::create(&output_path).context("couldn't open stdout file")?;

            let stdin = if task.reads_stdin() {
                Some(File::open(&input).context("couldn't read input file")?)
            } else {
                copy_file(&input, &box_file(&box_dir, &task.input_file)?).await?;
                None
            };

            let sandbox = self
                .sandbox
                .as_mut()
                .ok_or_else(|| anyhow!("sandbox is not initialized"))?;
            let streams = RunStreams {
                stdin,
                stdout,
                stderr: None,
            };
            let run = sandbox
                .run(streams, USER_PROGRAM, &[])
                .await
                .context("couldn't execute user program")?;
            debug!(
                test_no = number,
                outcome = %run.outcome,
                exit_code = run.exit_code,
                memory = run.memory_used,
                cpu_ms = run.cpu_time.as_millis() as u64,
                "Test run"
            );

            match failure_message(&run) {
                Some(message) => test.grader_message = message,
                None => {
                    if !task.writes_stdout() {
                        let produced = box_file(&box_dir, &task.output_file);
                        let copied = match produced {
                            Ok(path) => copy_file(&path, &output_path).await,
                            Err(e) => Err(e),
                        };
                        if copied.is_err() {
                            self.result.error_message = format!("err_no_output_file:{}", task.output_file);
                            return Ok(());
                        }
                    }
                    let (score, message) =
                        grade(&prepared.grader, &prepared.dir, &input, &output_path, &expected).await?;
                    sum += score;
                    test.score = score;
                    test.grader_message = message;
                }
            }

            test.memory = run.memory_used;
            test.time_ms = run.cpu_time.as_millis() as u64;
            self.result.test_results.push(test);
            self.deinit_sandbox().await?;
        }

        self.result.score = aggregate_score(sum, prepared.tests.len());
        Ok(())
    }

    async fn init_sandbox(&mut self, dataset: &Dataset) -> Result<PathBuf> {
        let cpu_time = Duration::from_millis(dataset.time_limit_ms);
        let config = BoxConfig {
            cpu_time,
            wall_time: cpu_time + WALL_GRACE,
            memory_limit: dataset.memory_limit,
            share_network: false,
            ..BoxConfig::default()
        };
        let mut sandbox = Sandbox::new(self.worker.sandboxes.as_ref(), self.worker.box_id, config);
        let path = sandbox.init().await.context("couldn't init sandbox")?;
        self.sandbox = Some(sandbox);
        Ok(path)
    }

    async fn deinit_sandbox(&mut self) -> Result<()> {
        if let Some(mut sandbox) = self.sandbox.take() {
            sandbox.cleanup().await.context("couldn't deinit sandbox")?;
        }
        Ok(())
    }

    async fn cleanup(mut self) {
        if let Err(e) = self.deinit_sandbox().await {
            error!(job_uuid = %self.job.uuid, error = %format!("{:#}", e), "Error while cleaning up");
        }
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().display().to_string();
            if let Err(e) = workspace.close() {
                error!(temp_dir = %path, error = %e, "Couldn't remove worker's temp dir");
            }
        }
    }
}

fn test_path(dir: &Path, number: i32, ext: &str) -> PathBuf {
    dir.join(format!("test{}.{}", number, ext))
}

/// A plain file name inside the box.
fn box_file(box_dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        bail!("invalid file name {:?}", name);
    }
    Ok(box_dir.join(name))
}

async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::copy(src, dst)
        .await
        .with_context(|| format!("couldn't copy file {} to {}", src.display(), dst.display()))?;
    tokio::fs::set_permissions(dst, Permissions::from_mode(0o755))
        .await
        .with_context(|| format!("couldn't make {} executable", dst.display()))?;
    Ok(())
}

/// Compile `program`. Returns its output and, on failure, the reason.
async fn build(program: &Program) -> (String, Option<String>) {
    match program.compile().await {
        Ok(output) if output.status.success() => (combined(&output), None),
        Ok(output) => (combined(&output), Some(output.status.to_string())),
        Err(e) => (String::new(), Some(format!("{:#}", e))),
    }
}

/// Run the grader as `grader <input> <output> <expected>` from the
/// workspace. Returns the score and the grader's message.
async fn grade(grader: &Program, dir: &Path, input: &Path, output: &Path, expected: &Path) -> Result<(Decimal, String)> {
    let args: Vec<String> = [input, output, expected]
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let out = grader
        .execute(&args)?
        .current_dir(dir)
        .output()
        .await
        .context("couldn't execute grader program")?;
    if !out.status.success() {
        bail!("couldn't execute grader program: {}", out.status);
    }
    let score = parse_score(&String::from_utf8_lossy(&out.stdout));
    let message = String::from_utf8_lossy(&out.stderr).trim().to_string();
    Ok((score, message))
}

/// The first line of grader output as a fraction. Anything unparseable is 0.
pub fn parse_score(stdout: &str) -> Decimal {
    stdout
        .lines()
        .next()
        .and_then(|line| Decimal::from_str(line.trim()).ok())
        .unwrap_or_else(zero_score)
}

/// Mean of the per-test fractions as a percentage with two decimals.
pub fn aggregate_score(sum: Decimal, tests: usize) -> Decimal {
    if tests == 0 {
        return zero_score();
    }
    let mut score = (sum / Decimal::from(tests) * Decimal::ONE_HUNDRED).round_dp(2);
    score.rescale(2);
    score
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        4 => "illegal instruction",
        6 => "aborted",
        8 => "floating point exception",
        9 => "killed",
        11 => "segmentation fault",
        13 => "broken pipe",
        15 => "terminated",
        24 => "CPU time limit exceeded",
        25 => "file size limit exceeded",
        _ => "unknown signal",
    }
}

/// Message recorded for a run that did not complete normally.
pub fn failure_message(run: &RunResult) -> Option<String> {
    match run.outcome {
        Outcome::NoError => None,
        Outcome::RunTimeError => Some(format!("Program exited with exit status {}", run.exit_code)),
        Outcome::KilledBySignal => {
            let signal = run.signal.unwrap_or_default();
            Some(format!("Killed by signal {}: {}", signal, signal_name(signal)))
        }
        Outcome::Timeout => Some("Time limit exceeded".to_string()),
        Outcome::MemoryExceeded => Some("Memory limit exceeded".to_string()),
        Outcome::InternalError => Some("Sandbox internal error".to_string()),
    }
}
