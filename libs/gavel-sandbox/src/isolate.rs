//! Linux runner driving `isolate(1)` with control groups.

use crate::error::{Result, SandboxError};
use crate::outcome::{RawStatus, RunResult};
use crate::runner::{BoxConfig, RunStreams, Runner, RunnerFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct IsolateFactory {
    pub binary: String,
}

impl Default for IsolateFactory {
    fn default() -> Self {
        Self {
            binary: "isolate".to_string(),
        }
    }
}

impl RunnerFactory for IsolateFactory {
    fn build(&self, box_id: u32, config: BoxConfig) -> Box<dyn Runner> {
        Box::new(IsolateRunner {
            binary: self.binary.clone(),
            box_id,
            config,
        })
    }
}

pub struct IsolateRunner {
    binary: String,
    box_id: u32,
    config: BoxConfig,
}

/// Parse the `key:value` meta file isolate writes after a run.
pub fn parse_meta(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Map isolate's `status` field to a raw status.
pub fn meta_status(meta: &HashMap<String, String>) -> Result<RawStatus> {
    let exit_code = meta
        .get("exitcode")
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);

    match meta.get("status").map(String::as_str) {
        None | Some("") => Ok(RawStatus::Unreported),
        Some("RE") => Ok(RawStatus::Exited(if exit_code == 0 { 1 } else { exit_code })),
        Some("SG") => {
            let signal = meta
                .get("exitsig")
                .and_then(|v| v.parse::<i32>().ok())
                .unwrap_or(0);
            Ok(RawStatus::Signaled(signal))
        }
        Some("TO") => Ok(RawStatus::TimedOut),
        Some("XX") => Ok(RawStatus::ToolFailure),
        Some(other) => Err(SandboxError::UnknownStatus(other.to_string())),
    }
}

fn seconds(meta: &HashMap<String, String>, key: &str) -> Duration {
    meta.get(key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or_default()
}

/// Build a `RunResult` from a parsed meta file.
pub fn result_from_meta(meta: &HashMap<String, String>, memory_limit: u64) -> Result<RunResult> {
    let status = meta_status(meta)?;
    let memory_used = meta
        .get("cg-mem")
        .or_else(|| meta.get("max-rss"))
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let mut result = RunResult::from_status(
        status,
        seconds(meta, "time"),
        seconds(meta, "time-wall"),
        memory_used,
        memory_limit,
    );
    if let RawStatus::Unreported = status {
        result.exit_code = meta
            .get("exitcode")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0);
    }
    Ok(result)
}

/// Arguments for `isolate --run`.
pub fn run_args(box_id: u32, config: &BoxConfig, meta_path: &Path, command: &str, args: &[String]) -> Vec<String> {
    let mut params = vec![
        "--silent".to_string(),
        "-M".to_string(),
        meta_path.display().to_string(),
        format!("--box-id={}", box_id),
    ];

    if !config.cpu_time.is_zero() {
        params.push(format!("--time={}", config.cpu_time.as_secs_f64()));
    }
    if !config.wall_time.is_zero() {
        params.push(format!("--wall-time={}", config.wall_time.as_secs_f64()));
    }
    if config.stack_limit > 0 {
        params.push(format!("--stack={}", config.stack_limit));
    }
    if config.memory_limit > 0 {
        params.push(format!("--cg-mem={}", config.memory_limit));
    }
    if config.max_processes == 0 {
        params.push("-p".to_string());
    } else {
        params.push(format!("--processes={}", config.max_processes));
    }
    if config.share_network {
        params.push("--share-net".to_string());
    }
    for env in &config.env {
        if env.value.is_empty() {
            params.push(format!("--env={}", env.var));
        } else {
            params.push(format!("--env={}={}", env.var, env.value));
        }
    }

    params.extend(["--cg".to_string(), "--run".to_string(), "--".to_string(), command.to_string()]);
    params.extend(args.iter().cloned());
    params
}

#[async_trait]
impl Runner for IsolateRunner {
    async fn init(&mut self) -> Result<PathBuf> {
        let output = Command::new(&self.binary)
            .arg("--cg")
            .arg(format!("--box-id={}", self.box_id))
            .arg("--init")
            .output()
            .await
            .map_err(|source| SandboxError::Spawn { tool: "isolate", source })?;

        if !output.status.success() {
            return Err(SandboxError::Init {
                box_id: self.box_id,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Path::new(&root).join("box"))
    }

    async fn run(&mut self, streams: RunStreams, command: &str, args: &[String]) -> Result<RunResult> {
        let meta_file = tempfile::Builder::new().prefix("gavel-meta").tempfile()?;
        let params = run_args(self.box_id, &self.config, meta_file.path(), command, args);
        debug!(box_id = self.box_id, ?params, "Running isolate");

        let (stdin, stdout, stderr) = streams.into_stdio();
        let status = Command::new(&self.binary)
            .args(&params)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await
            .map_err(|source| SandboxError::Spawn { tool: "isolate", source })?;

        let contents = tokio::fs::read_to_string(meta_file.path()).await?;
        let meta = parse_meta(&contents);
        if !meta.contains_key("status") && !status.success() {
            warn!(
                box_id = self.box_id,
                isolate_status = ?status.code(),
                "isolate exited unsuccessfully without reporting a status"
            );
        }
        result_from_meta(&meta, self.config.memory_limit)
    }

    async fn cleanup(&mut self) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("--cg")
            .arg(format!("--box-id={}", self.box_id))
            .arg("--cleanup")
            .output()
            .await
            .map_err(|source| SandboxError::Spawn { tool: "isolate", source })?;

        if !output.status.success() {
            return Err(SandboxError::Cleanup {
                box_id: self.box_id,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}
