//! FreeBSD runner built on `jail(8)`, `rctl(8)` and `jexec(8)`.

use crate::error::{Result, SandboxError};
use crate::outcome::{RawStatus, RunResult};
use crate::runner::{BoxConfig, RunStreams, Runner, RunnerFactory};
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;
use wait4::{ResUse, Wait4};

#[derive(Debug, Clone, Copy, Default)]
pub struct JailFactory;

impl RunnerFactory for JailFactory {
    fn build(&self, box_id: u32, config: BoxConfig) -> Box<dyn Runner> {
        Box::new(JailRunner {
            box_id,
            config,
            path: std::env::temp_dir().join(jail_name(box_id)),
        })
    }
}

pub struct JailRunner {
    box_id: u32,
    config: BoxConfig,
    path: PathBuf,
}

pub fn jail_name(box_id: u32) -> String {
    format!("gavel{}", box_id)
}

/// `rctl -a` rules for a config. Limits of zero are left unset.
pub fn rctl_rules(box_id: u32, config: &BoxConfig) -> Vec<String> {
    let name = jail_name(box_id);
    let mut rules = Vec::new();
    if config.memory_limit > 0 {
        rules.push(format!("jail:{}:memoryuse:sigsegv={}K/jail", name, config.memory_limit));
    }
    if config.stack_limit > 0 {
        rules.push(format!("jail:{}:stacksize:sigsegv={}K/jail", name, config.stack_limit));
    }
    if config.max_processes > 0 {
        rules.push(format!("jail:{}:maxproc:deny={}/jail", name, config.max_processes));
    }
    rules
}

/// Environment for the jailed process. Empty values are inherited from the host.
pub fn jail_env(config: &BoxConfig) -> Vec<(String, String)> {
    config
        .env
        .iter()
        .map(|e| {
            let value = if e.value.is_empty() {
                std::env::var(&e.var).unwrap_or_default()
            } else {
                e.value.clone()
            };
            (e.var.clone(), value)
        })
        .collect()
}

async fn exec(tool: &'static str, args: &[String]) -> Result<std::result::Result<(), String>> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|source| SandboxError::Spawn { tool, source })?;
    if output.status.success() {
        Ok(Ok(()))
    } else {
        Ok(Err(format!(
            "{} {}: {}",
            tool,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl Runner for JailRunner {
    async fn init(&mut self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.path).await?;

        let create = vec![
            "-c".to_string(),
            format!("name={}", jail_name(self.box_id)),
            format!("path={}", self.path.display()),
            "persist".to_string(),
        ];
        let mut steps = vec![("jail", create)];
        for rule in rctl_rules(self.box_id, &self.config) {
            steps.push(("rctl", vec!["-a".to_string(), rule]));
        }

        for (tool, args) in steps {
            if let Err(reason) = exec(tool, &args).await? {
                return Err(SandboxError::Init {
                    box_id: self.box_id,
                    reason,
                });
            }
        }
        Ok(self.path.clone())
    }

    async fn run(&mut self, streams: RunStreams, command: &str, args: &[String]) -> Result<RunResult> {
        let (stdin, stdout, stderr) = streams.into_stdio();
        let mut cmd = std::process::Command::new("jexec");
        cmd.arg(jail_name(self.box_id))
            .arg(format!("/{}", command))
            .args(args)
            .env_clear()
            .envs(jail_env(&self.config))
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr);
        debug!(box_id = self.box_id, command, "Running jexec");

        let wall_limit = self.config.wall_time;
        let memory_limit = self.config.memory_limit;

        tokio::task::spawn_blocking(move || -> Result<RunResult> {
            let mut child = cmd
                .spawn()
                .map_err(|source| SandboxError::Spawn { tool: "jexec", source })?;
            let started = Instant::now();
            let timed_out = Arc::new(AtomicBool::new(false));

            // The killer must be disarmed before the pid can be reused.
            let (disarm, armed) = mpsc::channel::<()>();
            if !wall_limit.is_zero() {
                let pid = child.id() as libc::pid_t;
                let timed_out = timed_out.clone();
                std::thread::spawn(move || {
                    if let Err(mpsc::RecvTimeoutError::Timeout) = armed.recv_timeout(wall_limit) {
                        timed_out.store(true, Ordering::SeqCst);
                        unsafe { libc::kill(pid, libc::SIGKILL) };
                    }
                });
            }

            let ResUse { status, rusage } = child.wait4()?;
            let wall_time = started.elapsed();
            let _ = disarm.send(());

            let raw = if timed_out.load(Ordering::SeqCst) {
                RawStatus::TimedOut
            } else if let Some(signal) = status.signal() {
                RawStatus::Signaled(signal)
            } else {
                RawStatus::Exited(status.code().unwrap_or(0))
            };
            Ok(RunResult::from_status(
                raw,
                rusage.utime + rusage.stime,
                wall_time,
                rusage.maxrss / 1024,
                memory_limit,
            ))
        })
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    async fn cleanup(&mut self) -> Result<()> {
        let name = jail_name(self.box_id);
        let steps = [
            ("rctl", vec!["-r".to_string(), format!("jail:{}", name)]),
            ("jail", vec!["-r".to_string(), name.clone()]),
        ];
        for (tool, args) in steps {
            if let Err(reason) = exec(tool, &args).await? {
                return Err(SandboxError::Cleanup {
                    box_id: self.box_id,
                    reason,
                });
            }
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
