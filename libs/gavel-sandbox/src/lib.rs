//! Process isolation for untrusted programs.
//!
//! A `Sandbox` wraps a platform `Runner`: `isolate` on Linux, jails on
//! FreeBSD. Both report a `RunResult` classified into an `Outcome`.

pub mod error;
pub mod isolate;
pub mod jail;
pub mod outcome;
pub mod runner;

pub use error::{Result, SandboxError};
pub use outcome::{classify, Outcome, RawStatus, RunResult};
pub use runner::{platform_factory, BoxConfig, EnvPair, RunStreams, Runner, RunnerFactory, Sandbox};
