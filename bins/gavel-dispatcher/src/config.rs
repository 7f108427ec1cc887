// Command line and environment configuration for the gavel dispatcher
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "gavel-dispatcher")]
#[command(about = "Gavel dispatcher - job queue, node health and dispatch", long_about = None)]
pub struct Config {
    /// Address the RPC server binds to
    #[arg(long, env = "GAVEL_LISTEN", default_value = "0.0.0.0:8090")]
    pub listen: String,

    /// SQLite database URL for the job store
    #[arg(long, env = "GAVEL_DATABASE_URL", default_value = "sqlite://gavel.db")]
    pub database_url: String,

    /// Connection pool size
    #[arg(long, env = "GAVEL_DB_MAX_CONNECTIONS", default_value_t = 8)]
    pub max_connections: u32,

    /// Seconds between health checks, each followed by a dispatch pass
    #[arg(long, env = "GAVEL_HEALTH_CHECK_INTERVAL", default_value_t = 10)]
    pub health_check_interval: u64,

    /// Seconds to wait for an eval node's status
    #[arg(long, env = "GAVEL_STATUS_TIMEOUT", default_value_t = 2)]
    pub status_timeout: u64,

    /// Seconds to wait for an eval node to accept a job
    #[arg(long, env = "GAVEL_ASSIGN_TIMEOUT", default_value_t = 10)]
    pub assign_timeout: u64,

    /// Pending dispatch triggers before kicks are coalesced
    #[arg(long, default_value_t = 64)]
    pub trigger_capacity: usize,

    /// Base URL of the core service receiving submission updates
    #[arg(long, env = "GAVEL_CORE_URL")]
    pub core_url: Option<String>,

    /// Static eval nodes as `id=address`, comma separated. Jobs are held
    /// under the name a node reports in its status, so `id` only labels the
    /// entry
    #[arg(long = "eval", env = "GAVEL_EVAL_NODES", value_delimiter = ',')]
    pub evals: Vec<String>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "GAVEL_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval.max(1))
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout)
    }

    pub fn assign_timeout(&self) -> Duration {
        Duration::from_secs(self.assign_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["gavel-dispatcher"]).unwrap();
        assert_eq!(config.listen, "0.0.0.0:8090");
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
        assert!(config.evals.is_empty());
        assert!(config.core_url.is_none());
    }

    #[test]
    fn test_static_evals_are_comma_separated() {
        let config =
            Config::try_parse_from(["gavel-dispatcher", "--eval", "eval-1=a:1,eval-2=b:1"]).unwrap();
        assert_eq!(config.evals, vec!["eval-1=a:1", "eval-2=b:1"]);
    }
}
