use std::fmt;
use std::time::Duration;

/// Unconditional-kill signal. A program killed with it while at its memory
/// ceiling was almost certainly killed by the memory controller.
pub const SIGKILL: i32 = 9;

/// Classified result of a sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    NoError,
    RunTimeError,
    KilledBySignal,
    Timeout,
    InternalError,
    MemoryExceeded,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::NoError => "NoError",
            Outcome::RunTimeError => "RunTimeError",
            Outcome::KilledBySignal => "KilledBySignal",
            Outcome::Timeout => "Timeout",
            Outcome::InternalError => "InternalError",
            Outcome::MemoryExceeded => "MemoryExceeded",
        };
        write!(f, "{}", s)
    }
}

/// Exit status as reported by the platform isolation tool, before
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    /// The tool reported no status at all.
    Unreported,
    Exited(i32),
    Signaled(i32),
    TimedOut,
    ToolFailure,
}

/// Classify a raw status.
///
/// Wall-clock timeouts win over everything else. A kill signal with memory
/// usage at or above a non-zero limit is reported as `MemoryExceeded`.
/// An unreported status maps to `NoError`.
pub fn classify(status: RawStatus, memory_used: u64, memory_limit: u64) -> Outcome {
    match status {
        RawStatus::TimedOut => Outcome::Timeout,
        RawStatus::ToolFailure => Outcome::InternalError,
        RawStatus::Signaled(signal) => {
            if signal == SIGKILL && memory_limit > 0 && memory_used >= memory_limit {
                Outcome::MemoryExceeded
            } else {
                Outcome::KilledBySignal
            }
        }
        RawStatus::Exited(0) => Outcome::NoError,
        RawStatus::Exited(_) => Outcome::RunTimeError,
        RawStatus::Unreported => Outcome::NoError,
    }
}

/// Measurements and classified outcome of one `Runner::run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    /// Peak memory in KiB
    pub memory_used: u64,
    pub signal: Option<i32>,
    pub outcome: Outcome,
}

impl RunResult {
    /// Build a result from raw measurements, deriving exit code, signal and
    /// outcome from `status`.
    pub fn from_status(
        status: RawStatus,
        cpu_time: Duration,
        wall_time: Duration,
        memory_used: u64,
        memory_limit: u64,
    ) -> Self {
        let (exit_code, signal) = match status {
            RawStatus::Exited(code) => (code, None),
            // shell convention
            RawStatus::Signaled(sig) => (128 + sig, Some(sig)),
            _ => (0, None),
        };
        Self {
            exit_code,
            cpu_time,
            wall_time,
            memory_used,
            signal,
            outcome: classify(status, memory_used, memory_limit),
        }
    }
}
