use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("couldn't init sandbox {box_id}: {reason}")]
    Init { box_id: u32, reason: String },

    #[error("couldn't clean up sandbox {box_id}: {reason}")]
    Cleanup { box_id: u32, reason: String },

    #[error("sandbox {0} is not initialized")]
    NotInitialized(u32),

    #[error("unknown run status {0}")]
    UnknownStatus(String),

    #[error("couldn't run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
