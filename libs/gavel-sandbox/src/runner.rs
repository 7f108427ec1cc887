use crate::error::{Result, SandboxError};
use crate::outcome::RunResult;
use async_trait::async_trait;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPair {
    pub var: String,
    /// Empty means "inherit from the host environment".
    pub value: String,
}

/// Resource limits for one box. Set once per instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxConfig {
    pub cpu_time: Duration,
    pub wall_time: Duration,
    /// KiB, 0 = unlimited
    pub memory_limit: u64,
    /// KiB, 0 = unlimited
    pub stack_limit: u64,
    /// 0 = unlimited
    pub max_processes: u32,
    pub share_network: bool,
    pub env: Vec<EnvPair>,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            cpu_time: Duration::ZERO,
            wall_time: Duration::ZERO,
            memory_limit: 0,
            stack_limit: 0,
            max_processes: 0,
            share_network: false,
            env: vec![EnvPair {
                var: "LIBC_FATAL_STDERR_".to_string(),
                value: "1".to_string(),
            }],
        }
    }
}

/// Standard streams handed to the sandboxed process.
#[derive(Debug)]
pub struct RunStreams {
    /// `None` gives the process an empty stdin.
    pub stdin: Option<File>,
    pub stdout: File,
    /// `None` discards stderr.
    pub stderr: Option<File>,
}

impl RunStreams {
    pub(crate) fn into_stdio(self) -> (Stdio, Stdio, Stdio) {
        let stdin = self.stdin.map(Stdio::from).unwrap_or_else(Stdio::null);
        let stderr = self.stderr.map(Stdio::from).unwrap_or_else(Stdio::null);
        (stdin, Stdio::from(self.stdout), stderr)
    }
}

/// A platform isolation primitive.
///
/// One instance drives one box id with one `BoxConfig`.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Create the box and return the directory the program runs in.
    async fn init(&mut self) -> Result<PathBuf>;

    async fn run(&mut self, streams: RunStreams, command: &str, args: &[String]) -> Result<RunResult>;

    /// Tear the box down. Also used to clear stale state left by a previous
    /// process under the same box id.
    async fn cleanup(&mut self) -> Result<()>;
}

/// Builds runners for a given box id and config.
pub trait RunnerFactory: Send + Sync {
    fn build(&self, box_id: u32, config: BoxConfig) -> Box<dyn Runner>;
}

/// The runner factory for the platform this binary was built for.
pub fn platform_factory() -> Arc<dyn RunnerFactory> {
    if cfg!(target_os = "freebsd") {
        Arc::new(crate::jail::JailFactory)
    } else {
        Arc::new(crate::isolate::IsolateFactory::default())
    }
}

/// An isolated execution context. Wraps a `Runner` and adds the
/// init-retry policy shared by every platform.
pub struct Sandbox {
    id: u32,
    runner: Box<dyn Runner>,
    path: Option<PathBuf>,
}

impl Sandbox {
    pub fn new(factory: &dyn RunnerFactory, id: u32, config: BoxConfig) -> Self {
        let runner = factory.build(id, config);
        Self {
            id,
            runner,
            path: None,
        }
    }

    /// Directory inside the box, available after `init`.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Initialize the box. A first failure is assumed to be stale state from
    /// an earlier run with the same id: clean up and try exactly once more.
    pub async fn init(&mut self) -> Result<PathBuf> {
        let path = match self.runner.init().await {
            Ok(path) => path,
            Err(first) => {
                warn!(box_id = self.id, error = %first, "Sandbox init failed, cleaning up and retrying");
                if let Err(e) = self.runner.cleanup().await {
                    debug!(box_id = self.id, error = %e, "Stale sandbox cleanup failed");
                }
                self.runner.init().await.map_err(|e| SandboxError::Init {
                    box_id: self.id,
                    reason: e.to_string(),
                })?
            }
        };
        debug!(box_id = self.id, sandbox_path = %path.display(), "Initialized sandbox");
        self.path = Some(path.clone());
        Ok(path)
    }

    pub async fn run(&mut self, streams: RunStreams, command: &str, args: &[String]) -> Result<RunResult> {
        if self.path.is_none() {
            return Err(SandboxError::NotInitialized(self.id));
        }
        self.runner.run(streams, command, args).await
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        self.runner.cleanup().await?;
        self.path = None;
        debug!(box_id = self.id, "Deinitialized sandbox");
        Ok(())
    }
}
