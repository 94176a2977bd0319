//! Unified configuration for cotflow.
//!
//! Settings are read from `.cotflow/cotflow.toml` and layered
//! file → environment → CLI. Every field has a default, so an empty or
//! missing file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [database]
//! path = ".cotflow/cotflow.db"
//!
//! [queue]
//! concurrency = 3
//! max_retries = 3
//! backoff_base_secs = 10
//! backoff_cap_secs = 30
//!
//! [recovery]
//! stall_threshold_secs = 300
//! retry_ceiling = 5
//! auto_recover = false
//!
//! [reasoning]
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [search]
//! model = "sonar"
//! max_queries = 5
//!
//! [continuation]
//! mode = "webhook"
//! endpoint = "http://localhost:8080/api"
//!
//! [logging]
//! format = "json"
//!
//! [[pipeline.phases]]
//! name = "research"
//! think = { prompt = "Plan searches about {topic}", mode = "sync" }
//! integrate = { prompt = "Summarise {evidence}", expected_fields = ["insights"] }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::plan::PipelinePlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file, relative paths resolve against the project directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".cotflow/cotflow.db")
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Maximum tasks in flight across all sessions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attempts per task before it fails terminally.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Upper bound for a single collaborator call made by a worker.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Longest the worker loop sleeps without checking the database.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_concurrency() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl QueueSection {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySection {
    /// Idle time after which an in-progress session counts as stalled.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Session retry count at which a fresh session is recommended.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Delay used for rate limits that carry no retry-after hint.
    #[serde(default = "default_rate_limit_wait_secs")]
    pub rate_limit_wait_secs: u64,
    /// Timeouts are retried while `retry_count` is below this.
    #[serde(default = "default_timeout_retry_limit")]
    pub timeout_retry_limit: u32,
    /// Restart hops after which a lineage is aborted instead.
    #[serde(default = "default_max_session_restarts")]
    pub max_session_restarts: u32,
    /// Apply recovery plans for stalled sessions during the periodic audit.
    #[serde(default)]
    pub auto_recover: bool,
    #[serde(default = "default_audit_interval_secs")]
    pub audit_interval_secs: u64,
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_rate_limit_wait_secs() -> u64 {
    60
}

fn default_timeout_retry_limit() -> u32 {
    2
}

fn default_max_session_restarts() -> u32 {
    2
}

fn default_audit_interval_secs() -> u64 {
    60
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            stall_threshold_secs: default_stall_threshold_secs(),
            retry_ceiling: default_retry_ceiling(),
            rate_limit_wait_secs: default_rate_limit_wait_secs(),
            timeout_retry_limit: default_timeout_retry_limit(),
            max_session_restarts: default_max_session_restarts(),
            auto_recover: false,
            audit_interval_secs: default_audit_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// How often due sessions are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Sessions picked per sweep, oldest first.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
    /// Bound on a synchronous reasoning step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_sweep_batch() -> usize {
    5
}

fn default_step_timeout_secs() -> u64 {
    180
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_batch: default_sweep_batch(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSection {
    #[serde(default = "default_reasoning_base_url")]
    pub base_url: String,
    #[serde(default = "default_reasoning_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_reasoning_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_reasoning_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_reasoning_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_reasoning_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            base_url: default_reasoning_base_url(),
            model: default_reasoning_model(),
            api_key_env: default_reasoning_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    #[serde(default = "default_search_model")]
    pub model: String,
    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Cap on SEARCH tasks enqueued for one EXECUTE step.
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
}

fn default_search_base_url() -> String {
    "https://api.perplexity.ai".to_string()
}

fn default_search_model() -> String {
    "sonar".to_string()
}

fn default_search_key_env() -> String {
    "PERPLEXITY_API_KEY".to_string()
}

fn default_max_queries() -> usize {
    5
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: default_search_base_url(),
            model: default_search_model(),
            api_key_env: default_search_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_queries: default_max_queries(),
        }
    }
}

/// Where task completions are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationMode {
    /// Straight into the scheduler of this process.
    #[default]
    InProcess,
    /// POST to an external endpoint.
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuationSection {
    #[serde(default)]
    pub mode: ContinuationMode,
    /// Base URL for webhook mode; `/sessions/{id}/continue` is appended.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter directive used when neither COTFLOW_LOG nor RUST_LOG is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for a daily rolling log file, in addition to stderr.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// Root of `.cotflow/cotflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CotflowToml {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub reasoning: ReasoningSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub continuation: ContinuationSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub pipeline: PipelinePlan,
}

impl CotflowToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cotflow.toml")
    }

    /// Load `cotflow.toml` from the given directory, or defaults when absent.
    pub fn load_or_default(cotflow_dir: &Path) -> Result<Self> {
        let config_path = cotflow_dir.join("cotflow.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize cotflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply COTFLOW_DB_PATH, COTFLOW_CONCURRENCY and COTFLOW_MAX_RETRIES.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("COTFLOW_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("COTFLOW_CONCURRENCY") {
            self.queue.concurrency = value
                .parse()
                .with_context(|| format!("Invalid COTFLOW_CONCURRENCY '{}'", value))?;
        }
        if let Ok(value) = std::env::var("COTFLOW_MAX_RETRIES") {
            self.queue.max_retries = value
                .parse()
                .with_context(|| format!("Invalid COTFLOW_MAX_RETRIES '{}'", value))?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.concurrency == 0 {
            warnings.push("queue.concurrency is 0: no task will ever run".to_string());
        }
        if self.queue.max_retries == 0 {
            warnings.push("queue.max_retries is 0: tasks fail without being attempted".to_string());
        }
        if self.queue.backoff_base_secs > self.queue.backoff_cap_secs {
            warnings.push(format!(
                "queue.backoff_base_secs ({}) exceeds backoff_cap_secs ({})",
                self.queue.backoff_base_secs, self.queue.backoff_cap_secs
            ));
        }
        if self.queue.poll_interval_secs == 0 {
            warnings.push("queue.poll_interval_secs is 0".to_string());
        }
        if self.search.max_queries == 0 {
            warnings.push("search.max_queries is 0: EXECUTE steps will gather nothing".to_string());
        }
        if self.continuation.mode == ContinuationMode::Webhook
            && self.continuation.endpoint.is_none()
        {
            warnings.push("continuation.mode is 'webhook' but no endpoint is set".to_string());
        }
        if self.recovery.retry_ceiling == 0 {
            warnings.push("recovery.retry_ceiling is 0: every session counts as exhausted".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings.extend(self.pipeline.validate());
        warnings
    }
}

/// Resolved configuration: the parsed file plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct CotflowConfig {
    pub project_dir: PathBuf,
    pub cotflow_dir: PathBuf,
    pub toml: CotflowToml,
}

impl CotflowConfig {
    /// Load `.cotflow/cotflow.toml` under `project_dir` and apply the environment.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let cotflow_dir = project_dir.join(".cotflow");
        let mut toml = CotflowToml::load_or_default(&cotflow_dir)?;
        toml.apply_env()?;

        Ok(Self {
            project_dir,
            cotflow_dir,
            toml,
        })
    }

    /// Create a config with CLI overrides applied last.
    pub fn with_cli_args(
        project_dir: PathBuf,
        db: Option<PathBuf>,
        concurrency: Option<usize>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        if let Some(db) = db {
            config.toml.database.path = db;
        }
        if let Some(c) = concurrency {
            config.toml.queue.concurrency = c;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.cotflow_dir.join("cotflow.toml")
    }

    /// Database path, resolved against the project directory.
    pub fn db_path(&self) -> PathBuf {
        let path = &self.toml.database.path;
        if path.is_absolute() {
            path.clone()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_ref().map(|d| {
            if d.is_absolute() {
                d.clone()
            } else {
                self.project_dir.join(d)
            }
        })
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        unsafe {
            std::env::remove_var("COTFLOW_DB_PATH");
            std::env::remove_var("COTFLOW_CONCURRENCY");
            std::env::remove_var("COTFLOW_MAX_RETRIES");
        }
    }

    #[test]
    fn test_cotflow_toml_parse_empty() {
        let toml = CotflowToml::parse("").unwrap();
        assert_eq!(toml.queue.concurrency, 3);
        assert_eq!(toml.queue.max_retries, 3);
        assert_eq!(toml.queue.backoff_base_secs, 10);
        assert_eq!(toml.queue.backoff_cap_secs, 30);
        assert_eq!(toml.recovery.stall_threshold_secs, 300);
        assert_eq!(toml.recovery.retry_ceiling, 5);
        assert_eq!(toml.recovery.rate_limit_wait_secs, 60);
        assert_eq!(toml.scheduler.sweep_batch, 5);
        assert_eq!(toml.pipeline.phase_count(), 3);
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_cotflow_toml_parse_sections() {
        let content = r#"
[queue]
concurrency = 8
backoff_base_secs = 2

[recovery]
auto_recover = true

[continuation]
mode = "webhook"
endpoint = "http://localhost:9000"

[logging]
format = "json"
"#;
        let toml = CotflowToml::parse(content).unwrap();
        assert_eq!(toml.queue.concurrency, 8);
        assert_eq!(toml.queue.backoff_base_secs, 2);
        assert_eq!(toml.queue.max_retries, 3);
        assert!(toml.recovery.auto_recover);
        assert_eq!(toml.continuation.mode, ContinuationMode::Webhook);
        assert_eq!(toml.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_cotflow_toml_custom_pipeline_replaces_default() {
        let content = r#"
[[pipeline.phases]]
name = "only"
think = { prompt = "plan {topic}", mode = "sync" }
integrate = { prompt = "write", expected_fields = ["posts"] }
"#;
        let toml = CotflowToml::parse(content).unwrap();
        assert_eq!(toml.pipeline.phase_count(), 1);
        let phase = toml.pipeline.phase(1).unwrap();
        assert_eq!(phase.integrate.expected_fields, vec!["posts".to_string()]);
    }

    #[test]
    fn test_cotflow_toml_validate_warnings() {
        let content = r#"
[queue]
concurrency = 0
backoff_base_secs = 60

[continuation]
mode = "webhook"
"#;
        let warnings = CotflowToml::parse(content).unwrap().validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("concurrency")));
        assert!(warnings.iter().any(|w| w.contains("endpoint")));
    }

    #[test]
    fn test_cotflow_toml_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("COTFLOW_CONCURRENCY", "7");
            std::env::set_var("COTFLOW_DB_PATH", "/tmp/other.db");
        }
        let mut toml = CotflowToml::default();
        toml.apply_env().unwrap();
        assert_eq!(toml.queue.concurrency, 7);
        assert_eq!(toml.database.path, PathBuf::from("/tmp/other.db"));

        unsafe { std::env::set_var("COTFLOW_MAX_RETRIES", "lots") };
        assert!(CotflowToml::default().apply_env().is_err());
        clear_env();
    }

    #[test]
    fn test_cotflow_toml_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cotflow.toml");
        let mut toml = CotflowToml::default();
        toml.queue.concurrency = 4;
        toml.save(&path).unwrap();
        let loaded = CotflowToml::load(&path).unwrap();
        assert_eq!(loaded.queue.concurrency, 4);
        assert_eq!(loaded.pipeline, toml.pipeline);
    }

    #[test]
    fn test_cotflow_toml_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = CotflowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.queue.concurrency, 3);
    }

    #[test]
    fn test_cotflow_config_paths_and_cli_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        let config =
            CotflowConfig::with_cli_args(dir.path().to_path_buf(), None, Some(9)).unwrap();
        assert_eq!(config.toml.queue.concurrency, 9);
        assert!(config.db_path().ends_with(".cotflow/cotflow.db"));
        assert!(config.db_path().is_absolute());
        assert!(config.config_file().ends_with(".cotflow/cotflow.toml"));
        assert!(config.log_dir().is_none());
    }
}
