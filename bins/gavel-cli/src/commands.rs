// CLI commands for driving a Gavel deployment
use anyhow::{bail, Context, Result};
use chrono::Utc;
use gavel_common::client::{DispatcherClient, EvalNodeClient};
use gavel_common::languages::{default_languages, LanguageConfig, LanguagesFile};
use gavel_common::rpc::{DispatchOutcome, SearchFilter};
use gavel_common::types::{Job, JobState, NodeInfo};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub struct Clients {
    dispatcher: DispatcherClient,
    evals: EvalNodeClient,
}

impl Clients {
    pub fn new(dispatcher_url: &str, timeout_secs: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        Ok(Self {
            dispatcher: DispatcherClient::new(dispatcher_url, timeout)?,
            evals: EvalNodeClient::new(timeout)?,
        })
    }
}

/// Pick the language whose extension matches `file`.
pub fn guess_language(file: &Path, languages: &[LanguageConfig]) -> Result<String> {
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match languages.iter().find(|l| l.extension == ext) {
        Some(lang) => Ok(lang.name.clone()),
        None => bail!("Can't guess the language of {}, pass --language", file.display()),
    }
}

/// Submit a source file
pub async fn submit(
    clients: &Clients,
    file: &Path,
    dataset: &str,
    task: &str,
    submission: &str,
    language: Option<&str>,
    priority: i32,
) -> Result<()> {
    let code = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let language = match language {
        Some(lang) => lang.to_string(),
        None => guess_language(file, &default_languages())?,
    };
    println!("🚀 Submitting {} as {}", file.display(), language);

    let job = Job {
        uuid: Uuid::nil(),
        dataset_id: dataset.to_string(),
        code,
        language,
        eval_id: String::new(),
        state: JobState::Waiting,
        submission_id: submission.to_string(),
        task_id: task.to_string(),
        created_at: Utc::now(),
        finished_at: None,
        result: None,
    };
    let uuid = clients
        .dispatcher
        .create_job(priority, job)
        .await
        .context("Failed to create job")?;

    println!("✅ Job queued: {}", uuid);
    println!("\n📋 Follow it with: gavel-cli job {}", uuid);
    Ok(())
}

pub async fn show_job(clients: &Clients, uuid: &Uuid) -> Result<()> {
    let job = clients.dispatcher.read_job(uuid).await.context("Failed to read job")?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn search(clients: &Clients, filter: &SearchFilter) -> Result<()> {
    let jobs = clients
        .dispatcher
        .search_jobs(filter)
        .await
        .context("Failed to search jobs")?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    print!("{}", jobs_table(&jobs));
    println!("\n✅ Total: {} job(s)", jobs.len());
    Ok(())
}

pub fn jobs_table(jobs: &[Job]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<38} {:<11} {:<8} {:<16} {:>7}  {}",
        "UUID", "STATE", "LANG", "EVAL", "SCORE", "ERROR"
    );
    let _ = writeln!(out, "{}", "─".repeat(100));
    for job in jobs {
        let (score, error) = match &job.result {
            Some(result) => (result.score.to_string(), result.error_message.as_str()),
            None => ("-".to_string(), ""),
        };
        let eval = if job.eval_id.is_empty() { "-" } else { job.eval_id.as_str() };
        let _ = writeln!(
            out,
            "{:<38} {:<11} {:<8} {:<16} {:>7}  {}",
            job.uuid,
            job.state,
            job.language,
            eval,
            score,
            error.lines().next().unwrap_or_default()
        );
    }
    out
}

pub async fn list_evals(clients: &Clients, refresh: bool) -> Result<()> {
    let evals = clients
        .dispatcher
        .get_evals(refresh)
        .await
        .context("Failed to get eval nodes")?;
    if evals.is_empty() {
        println!("No eval nodes alive.");
        return Ok(());
    }
    print!("{}", evals_table(&evals));
    let idle = evals.iter().filter(|e| e.is_available()).count();
    println!("\n✅ Total: {} node(s), {} ready for work", evals.len(), idle);
    Ok(())
}

pub fn evals_table(evals: &[NodeInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<24} {:<22} {:<9}  {}",
        "ID", "NAME", "ADDRESS", "STATE", "DESCRIPTION"
    );
    let _ = writeln!(out, "{}", "─".repeat(100));
    for node in evals {
        let state = if node.disabled {
            "disabled"
        } else if node.idle {
            "idle"
        } else {
            "busy"
        };
        let _ = writeln!(
            out,
            "{:<20} {:<24} {:<22} {:<9}  {}",
            node.id, node.name, node.address, state, node.description
        );
    }
    out
}

pub async fn dispatch(clients: &Clients) -> Result<()> {
    let outcome = clients
        .dispatcher
        .dispatch_next()
        .await
        .context("Failed to run dispatch")?;
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

pub fn describe_outcome(outcome: &DispatchOutcome) -> String {
    match outcome {
        DispatchOutcome::Dispatched { job_uuid, eval } => format!("✅ Job {} assigned to {}", job_uuid, eval),
        DispatchOutcome::QueueEmpty => "💤 Queue is empty".to_string(),
        DispatchOutcome::NoIdleNode { job_uuid } => {
            format!("⏳ No idle eval node, job {} stays queued", job_uuid)
        }
        DispatchOutcome::Conflict { job_uuid } => format!("⚠️  Job {} was claimed elsewhere", job_uuid),
        DispatchOutcome::Failed { reason } => format!("❌ Dispatch failed: {}", reason),
    }
}

pub async fn node_status(clients: &Clients, address: &str) -> Result<()> {
    let mut info = clients
        .evals
        .status(address)
        .await
        .with_context(|| format!("Failed to reach eval node at {}", address))?;
    if info.address.is_empty() {
        info.address = address.to_string();
    }
    print!("{}", evals_table(&[info]));
    Ok(())
}

pub async fn set_disabled(clients: &Clients, address: &str, disabled: bool) -> Result<()> {
    clients
        .evals
        .set_disabled(address, disabled)
        .await
        .with_context(|| format!("Failed to update eval node at {}", address))?;
    if disabled {
        println!("🛑 Eval node {} disabled", address);
    } else {
        println!("✅ Eval node {} enabled", address);
    }
    Ok(())
}

/// Write `config/languages.json` under `path` with the stock toolchains.
pub fn init_project(path: &Path, force: bool) -> Result<PathBuf> {
    println!("🚀 Initializing Gavel eval config at: {}", path.display());

    let config_dir = path.join("config");
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create directory: {}", config_dir.display()))?;

    let languages_path = config_dir.join("languages.json");
    if languages_path.exists() && !force {
        println!("  ⏭️  Kept existing: {}", languages_path.display());
        return Ok(languages_path);
    }

    let file = LanguagesFile {
        languages: default_languages(),
    };
    let json_content = serde_json::to_string_pretty(&file).context("Failed to serialize languages.json")?;
    fs::write(&languages_path, json_content).context("Failed to write languages.json")?;
    println!("  ✅ Created: {}", languages_path.display());

    println!("\n📋 Next steps:");
    println!("  1. Adjust compiler flags in {}", languages_path.display());
    println!("  2. Start the worker: gavel-worker --languages {}", languages_path.display());
    Ok(languages_path)
}

fn load_languages(path: &Path) -> Result<LanguagesFile> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).context("Failed to parse languages.json")
}

pub fn list_languages(path: &Path) -> Result<()> {
    let file = load_languages(path)?;
    if file.languages.is_empty() {
        println!("No languages configured.");
        println!("\n💡 Write the stock toolchains with: gavel-cli init");
        return Ok(());
    }

    println!("📋 Configured Languages:\n");
    println!("{:<8} {:<6} {}", "NAME", "EXT", "COMPILE");
    println!("{}", "─".repeat(100));
    for lang in &file.languages {
        println!("{:<8} {:<6} {}", lang.name, lang.extension, lang.compile.join(" "));
    }
    println!("\n✅ Total: {} language(s)", file.languages.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::types::{zero_score, JobResult};

    #[test]
    fn test_guess_language_from_extension() {
        let languages = default_languages();
        assert_eq!(guess_language(Path::new("sol.cpp"), &languages).unwrap(), "cpp");
        assert_eq!(guess_language(Path::new("dir/main.go"), &languages).unwrap(), "go");
        let err = guess_language(Path::new("Main.java"), &languages).unwrap_err();
        assert!(err.to_string().contains("--language"));
        assert!(guess_language(Path::new("Makefile"), &languages).is_err());
    }

    #[test]
    fn test_init_writes_stock_languages_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_project(dir.path(), false).unwrap();
        assert_eq!(path, dir.path().join("config/languages.json"));

        let file = load_languages(&path).unwrap();
        let names: Vec<&str> = file.languages.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["c", "cpp", "go"]);

        fs::write(&path, r#"{"languages": []}"#).unwrap();
        init_project(dir.path(), false).unwrap();
        assert!(load_languages(&path).unwrap().languages.is_empty());

        init_project(dir.path(), true).unwrap();
        assert_eq!(load_languages(&path).unwrap().languages.len(), 3);
    }

    #[test]
    fn test_jobs_table() {
        let mut job = Job {
            uuid: Uuid::new_v4(),
            dataset_id: "ds".to_string(),
            code: Vec::new(),
            language: "go".to_string(),
            eval_id: String::new(),
            state: JobState::Waiting,
            submission_id: "sub".to_string(),
            task_id: "task".to_string(),
            created_at: Utc::now(),
            finished_at: None,
            result: None,
        };
        let waiting = jobs_table(&[job.clone()]);
        assert!(waiting.contains(&job.uuid.to_string()));
        assert!(waiting.contains("WAITING"));

        job.state = JobState::Done;
        job.eval_id = "eval-1".to_string();
        job.result = Some(JobResult {
            error_message: "err_userprogram_compilation:exit status: 1\nmore".to_string(),
            score: zero_score(),
            ..JobResult::default()
        });
        let done = jobs_table(&[job]);
        assert!(done.contains("eval-1"));
        assert!(done.contains("0.00"));
        assert!(done.contains("err_userprogram_compilation:exit status: 1"));
        assert!(!done.contains("more"));
    }

    #[test]
    fn test_evals_table_states() {
        let nodes = vec![
            NodeInfo {
                id: "eval-1".to_string(),
                idle: true,
                ..NodeInfo::default()
            },
            NodeInfo {
                id: "eval-2".to_string(),
                idle: true,
                disabled: true,
                ..NodeInfo::default()
            },
            NodeInfo {
                id: "eval-3".to_string(),
                ..NodeInfo::default()
            },
        ];
        let table = evals_table(&nodes);
        let rows: Vec<&str> = table.lines().skip(2).collect();
        assert!(rows[0].contains("idle"));
        assert!(rows[1].contains("disabled"));
        assert!(rows[2].contains("busy"));
    }

    #[test]
    fn test_describe_outcome() {
        let uuid = Uuid::new_v4();
        let text = describe_outcome(&DispatchOutcome::Dispatched {
            job_uuid: uuid,
            eval: "eval-1".to_string(),
        });
        assert!(text.contains(&uuid.to_string()));
        assert!(text.contains("eval-1"));
        assert!(describe_outcome(&DispatchOutcome::QueueEmpty).contains("empty"));
    }
}
