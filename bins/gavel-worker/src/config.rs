// Command line and language configuration for the gavel eval node
use anyhow::{bail, Context, Result};
use clap::Parser;
use gavel_common::languages::{default_languages, LanguageConfig, LanguagesFile};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug, Clone)]
#[command(name = "gavel-worker")]
#[command(about = "Gavel eval node - compiles, sandboxes and grades submissions", long_about = None)]
pub struct WorkerConfig {
    /// Name of the eval node (defaults to <hostname>-<random>)
    #[arg(long, env = "GAVEL_EVAL_NAME")]
    pub name: Option<String>,

    /// Free-form description reported in the node status
    #[arg(long, env = "GAVEL_EVAL_DESCRIPTION", default_value = "")]
    pub description: String,

    /// Address the RPC server binds to
    #[arg(long, env = "GAVEL_LISTEN", default_value = "0.0.0.0:8091")]
    pub listen: String,

    /// Address the dispatcher should use to reach this node
    #[arg(long, env = "GAVEL_ADVERTISE")]
    pub advertise: Option<String>,

    #[arg(long, env = "GAVEL_DISPATCHER_URL", default_value = "http://127.0.0.1:8090")]
    pub dispatcher_url: String,

    /// Core service holding datasets, tasks, graders and attachments
    #[arg(long, env = "GAVEL_CORE_URL", default_value = "http://127.0.0.1:8080")]
    pub core_url: String,

    /// Sandbox box id, unique per host
    #[arg(long, env = "GAVEL_BOX_ID", default_value_t = 0)]
    pub box_id: u32,

    /// Path to languages.json; the stock toolchains are used when absent
    #[arg(long, env = "GAVEL_LANGUAGES", default_value = "config/languages.json")]
    pub languages: PathBuf,

    /// Seconds between registration heartbeats
    #[arg(long, default_value_t = 15)]
    pub register_interval: u64,

    /// Seconds a registration stays valid without a heartbeat
    #[arg(long, default_value_t = 30)]
    pub register_ttl: u64,

    /// Timeout in seconds for calls to the dispatcher and core service
    #[arg(long, default_value_t = 30)]
    pub rpc_timeout: u64,

    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    #[arg(long, env = "GAVEL_LOG_JSON")]
    pub log_json: bool,
}

impl WorkerConfig {
    /// The configured name, or `<hostname>-<random>`.
    pub fn node_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let host = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| fs::read_to_string("/etc/hostname").ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "eval".to_string());
        let id = Uuid::new_v4().to_string();
        let suffix = id.split('-').nth(1).unwrap_or("0000");
        format!("{}-{}", host, suffix)
    }

    pub fn advertise_address(&self) -> String {
        self.advertise.clone().unwrap_or_else(|| self.listen.clone())
    }

    pub fn register_interval(&self) -> Duration {
        Duration::from_secs(self.register_interval.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    pub fn new(languages: Vec<LanguageConfig>) -> Self {
        let configs = languages
            .into_iter()
            .map(|lang| (lang.name.clone(), lang))
            .collect();
        Self { configs }
    }

    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let file: LanguagesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        for lang in &file.languages {
            if lang.compile.is_empty() {
                bail!("Language {} has an empty compile command", lang.name);
            }
        }

        Ok(Self::new(file.languages))
    }

    /// Load `path` when it exists, otherwise the stock toolchains.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new(default_languages()))
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &str) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
