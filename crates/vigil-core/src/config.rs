//! Configuration for the scan orchestration daemon.
//!
//! Key=value config file merged over defaults; `#` comments and quoted
//! values are accepted. Secrets (hosting token, LLM key) are never config
//! keys — they come from the environment via the daemon's secrets module.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Daemon configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories
    /// Daemon state directory (database, progress side-channel).
    pub data_dir: PathBuf,
    /// Shared workspace for analyzer tools and their reports.
    pub scan_dir: PathBuf,

    // Dependent services
    pub analysis_service_url: String,
    pub remediation_service_url: String,
    pub sandbox_service_url: String,

    // LLM endpoint (chat-completions compatible)
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_temperature: f64,
    pub llm_timeout_sec: u32,
    pub llm_retries: u32,
    pub llm_retry_backoff_sec: u32,

    // Hosting platform
    pub hosting_api_base: String,
    /// Domain that gets token-injected clone/push URLs.
    pub hosting_domain: String,
    /// Base branch that remediation PRs target.
    pub pr_base_branch: String,

    // Pipeline limits
    /// Maximum findings pushed through the triage workflow per scan.
    pub triage_limit: usize,
    /// Simultaneous jobs per worker process.
    pub worker_concurrency: usize,
    pub readiness_timeout_sec: u64,
    pub readiness_poll_interval_sec: u64,
    pub scanner_timeout_sec: u64,
    pub queue_poll_interval_ms: u64,

    // Analyzer driver
    /// Additional semgrep ruleset paths appended to the baseline packs.
    pub extra_rule_paths: Vec<String>,

    // Workflow extension point: gate patch acceptance on sandbox verification.
    pub sandbox_verify_patches: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/vigild"),
            scan_dir: PathBuf::from("/tmp/scans"),
            analysis_service_url: "http://analysis:8000".to_string(),
            remediation_service_url: "http://remediation:8000".to_string(),
            sandbox_service_url: "http://sandbox:8000".to_string(),
            llm_base_url: "http://localhost:1234/v1".to_string(),
            llm_model: "deepseek-coder-v2-lite".to_string(),
            llm_max_tokens: 4096,
            llm_temperature: 0.1,
            llm_timeout_sec: 300,
            llm_retries: 2,
            llm_retry_backoff_sec: 5,
            hosting_api_base: "https://api.github.com".to_string(),
            hosting_domain: "github.com".to_string(),
            pr_base_branch: "main".to_string(),
            triage_limit: 20,
            worker_concurrency: 1,
            readiness_timeout_sec: 300,
            readiness_poll_interval_sec: 5,
            scanner_timeout_sec: 600,
            queue_poll_interval_ms: 500,
            extra_rule_paths: Vec::new(),
            sandbox_verify_patches: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "scan_dir" => self.scan_dir = PathBuf::from(value),
            "analysis_service_url" => self.analysis_service_url = value.to_string(),
            "remediation_service_url" => self.remediation_service_url = value.to_string(),
            "sandbox_service_url" => self.sandbox_service_url = value.to_string(),
            "llm_base_url" => self.llm_base_url = value.to_string(),
            "llm_model" => self.llm_model = value.to_string(),
            "llm_max_tokens" => self.llm_max_tokens = Self::parse_int(key, value)?,
            "llm_temperature" => {
                self.llm_temperature = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "llm_timeout_sec" => self.llm_timeout_sec = Self::parse_int(key, value)?,
            "llm_retries" => self.llm_retries = Self::parse_int(key, value)?,
            "llm_retry_backoff_sec" => self.llm_retry_backoff_sec = Self::parse_int(key, value)?,
            "hosting_api_base" => self.hosting_api_base = value.to_string(),
            "hosting_domain" => self.hosting_domain = value.to_string(),
            "pr_base_branch" => self.pr_base_branch = value.to_string(),
            "triage_limit" => self.triage_limit = Self::parse_int(key, value)?,
            "worker_concurrency" => self.worker_concurrency = Self::parse_int(key, value)?,
            "readiness_timeout_sec" => self.readiness_timeout_sec = Self::parse_int(key, value)?,
            "readiness_poll_interval_sec" => {
                self.readiness_poll_interval_sec = Self::parse_int(key, value)?;
            }
            "scanner_timeout_sec" => self.scanner_timeout_sec = Self::parse_int(key, value)?,
            "queue_poll_interval_ms" => self.queue_poll_interval_ms = Self::parse_int(key, value)?,
            "extra_rule_paths" => {
                // Pipe-separated list of ruleset paths
                self.extra_rule_paths = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "sandbox_verify_patches" => {
                self.sandbox_verify_patches = Self::parse_bool(key, value)?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Path of the sqlite database under the data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("vigil.db")
    }

    /// Directory for the progress side-channel field maps.
    pub fn progress_dir(&self) -> PathBuf {
        self.data_dir.join("progress")
    }
}
