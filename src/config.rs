//! Layered configuration for review-pulse.
//!
//! Settings are read from `.review-pulse/pulse.toml` in the project directory,
//! falling back to `~/.review-pulse/pulse.toml`, then overridden by `PULSE_*`
//! environment variables and finally by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [worker]
//! bind = "127.0.0.1"
//! port = 7340
//! data_dir = ".review-pulse/data"
//! log_format = "pretty"
//!
//! [source]
//! api_base = "https://reviews.example.com/v1"
//! consumer_id = "abc-123"
//! key_version = "2"
//! timeout_secs = 10
//!
//! [scoring]
//! endpoint = "https://sentiment.example.com"
//! batch_size = 25
//! max_text_bytes = 5000
//!
//! [runs]
//! max_records = 1000
//! page_size = 10
//! weight_policy = "uniform"
//! language_code = "en"
//!
//! [retry.fetch]
//! initial_interval_ms = 2000
//! backoff_coefficient = 3.0
//! maximum_attempts = 15
//!
//! [retry.score]
//! initial_interval_ms = 500
//! non_retryable = ["invalid_input", "unauthorized"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::WeightPolicy;
use crate::retry::RetryPolicy;
use crate::scoring::DEFAULT_MAX_TEXT_BYTES;
use crate::scoring::http::MAX_BATCH_SIZE;
use crate::source::ConsumerHeaders;
use crate::worker::RunDefaults;

/// Directory holding `pulse.toml` and, by default, the worker's data.
pub const CONFIG_DIR: &str = ".review-pulse";
pub const CONFIG_FILE: &str = "pulse.toml";

/// Output format of the console log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Where checkpoints, pages and logs live. Relative paths resolve against
    /// the project directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Address CLI commands talk to, when the worker is not local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7340
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            data_dir: None,
            log_format: LogFormat::default(),
            url: None,
        }
    }
}

/// `[source]` section: the paginated review API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<String>,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
    /// Product page base; a run's URL is this plus its source id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_url_base: Option<String>,
}

fn default_source_timeout() -> u64 {
    10
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            api_base: None,
            consumer_id: None,
            key_version: None,
            timeout_secs: default_source_timeout(),
            product_url_base: None,
        }
    }
}

impl SourceSection {
    pub fn headers(&self) -> ConsumerHeaders {
        ConsumerHeaders {
            consumer_id: self.consumer_id.clone(),
            key_version: self.key_version.clone(),
        }
    }
}

/// `[scoring]` section: the batch sentiment service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_scoring_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,
}

fn default_scoring_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_max_text_bytes() -> usize {
    DEFAULT_MAX_TEXT_BYTES
}

impl Default for ScoringSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_scoring_timeout(),
            batch_size: default_batch_size(),
            max_text_bytes: default_max_text_bytes(),
        }
    }
}

/// `[runs]` section: defaults for fields a start request leaves out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsSection {
    #[serde(default = "default_max_records")]
    pub max_records: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub weight_policy: WeightPolicy,
    #[serde(default = "default_language_code")]
    pub language_code: String,
}

fn default_max_records() -> u64 {
    1000
}

fn default_page_size() -> u32 {
    10
}

fn default_language_code() -> String {
    "en".to_string()
}

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            page_size: default_page_size(),
            weight_policy: WeightPolicy::default(),
            language_code: default_language_code(),
        }
    }
}

impl RunsSection {
    pub fn to_run_defaults(&self) -> RunDefaults {
        RunDefaults {
            max_records: self.max_records,
            page_size: self.page_size,
            weight_policy: self.weight_policy,
            language_code: self.language_code.clone(),
            product_url_base: None,
        }
    }
}

/// Overrides for one retry domain. Unset fields keep the domain's built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval_ms: Option<u64>,
    /// `0` retries without limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_attempts: Option<u32>,
    /// `0` disables the per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_retryable: Option<Vec<String>>,
}

impl RetryOverride {
    /// Layer these overrides on top of `base`.
    pub fn apply(&self, mut base: RetryPolicy) -> RetryPolicy {
        if let Some(ms) = self.initial_interval_ms {
            base.initial_interval = Duration::from_millis(ms);
        }
        if let Some(coefficient) = self.backoff_coefficient {
            base.backoff_coefficient = coefficient;
        }
        if let Some(ms) = self.maximum_interval_ms {
            base.maximum_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.maximum_attempts {
            base.maximum_attempts = (attempts > 0).then_some(attempts);
        }
        if let Some(ms) = self.attempt_timeout_ms {
            base.attempt_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ref classes) = self.non_retryable {
            base.non_retryable = classes.iter().cloned().collect();
        }
        base
    }

    fn validate(&self, domain: &str, warnings: &mut Vec<String>) {
        if let Some(coefficient) = self.backoff_coefficient
            && !(coefficient >= 1.0 && coefficient.is_finite())
        {
            warnings.push(format!(
                "retry.{}.backoff_coefficient is {}: should be a finite number >= 1.0",
                domain, coefficient
            ));
        }
        if let (Some(initial), Some(max)) = (self.initial_interval_ms, self.maximum_interval_ms)
            && initial > max
        {
            warnings.push(format!(
                "retry.{}.initial_interval_ms ({}) exceeds maximum_interval_ms ({})",
                domain, initial, max
            ));
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub fetch: RetryOverride,
    #[serde(default)]
    pub score: RetryOverride,
}

/// Root of `pulse.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PulseToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub scoring: ScoringSection,
    #[serde(default)]
    pub runs: RunsSection,
    #[serde(default)]
    pub retry: RetrySection,
}

impl PulseToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pulse.toml")
    }

    /// Load `pulse.toml` from `config_dir`, or the default configuration if absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pulse.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PULSE_*` overrides, looking each variable up through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("PULSE_SOURCE_API_BASE") {
            self.source.api_base = Some(v);
        }
        if let Some(v) = var("PULSE_SOURCE_CONSUMER_ID") {
            self.source.consumer_id = Some(v);
        }
        if let Some(v) = var("PULSE_SOURCE_KEY_VERSION") {
            self.source.key_version = Some(v);
        }
        if let Some(v) = var("PULSE_SCORING_ENDPOINT") {
            self.scoring.endpoint = Some(v);
        }
        if let Some(v) = var("PULSE_SCORING_API_KEY") {
            self.scoring.api_key = Some(v);
        }
        if let Some(v) = var("PULSE_WORKER_URL") {
            self.worker.url = Some(v);
        }
    }

    /// Apply `PULSE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    pub fn fetch_policy(&self) -> RetryPolicy {
        self.retry.fetch.apply(RetryPolicy::fetch_defaults())
    }

    pub fn score_policy(&self) -> RetryPolicy {
        self.retry.score.apply(RetryPolicy::score_defaults())
    }

    /// Validate configuration and return warnings.
    /// Run defaults for the worker: `[runs]` plus the product URL base.
    pub fn run_defaults(&self) -> RunDefaults {
        RunDefaults {
            product_url_base: self.source.product_url_base.clone(),
            ..self.runs.to_run_defaults()
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(base) = &self.source.product_url_base
            && !reqwest::Url::parse(base).is_ok_and(|url| !url.cannot_be_a_base())
        {
            warnings.push(format!(
                "source.product_url_base '{}' is not a usable URL: runs will have no product URL",
                base
            ));
        }

        if self.runs.page_size == 0 {
            warnings.push("runs.page_size is 0: every run would be rejected".to_string());
        }
        if self.runs.language_code.trim().is_empty() {
            warnings.push("runs.language_code is empty".to_string());
        }
        if self.scoring.batch_size == 0 || self.scoring.batch_size > MAX_BATCH_SIZE {
            warnings.push(format!(
                "scoring.batch_size {} is outside 1..={}: it will be clamped",
                self.scoring.batch_size, MAX_BATCH_SIZE
            ));
        }
        if self.scoring.max_text_bytes == 0 {
            warnings.push("scoring.max_text_bytes is 0: texts cannot be chunked".to_string());
        }
        if self.source.api_base.is_none() {
            warnings.push(
                "source.api_base is not set (or PULSE_SOURCE_API_BASE): the worker cannot fetch"
                    .to_string(),
            );
        }
        if self.scoring.endpoint.is_none() {
            warnings.push(
                "scoring.endpoint is not set (or PULSE_SCORING_ENDPOINT): the worker cannot score"
                    .to_string(),
            );
        }

        self.retry.fetch.validate("fetch", &mut warnings);
        self.retry.score.validate("score", &mut warnings);

        warnings
    }
}

/// Resolved configuration for one invocation: file, environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct PulseConfig {
    pub project_dir: PathBuf,
    /// `<project>/.review-pulse`
    pub config_dir: PathBuf,
    pub toml: PulseToml,
    pub verbose: bool,
    /// CLI override for the worker address.
    pub cli_worker_url: Option<String>,
}

impl PulseConfig {
    /// Load configuration for `project_dir`, including environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = if config_dir.join(CONFIG_FILE).exists() {
            PulseToml::load_or_default(&config_dir)?
        } else {
            match dirs::home_dir().map(|home| home.join(CONFIG_DIR)) {
                Some(global) => PulseToml::load_or_default(&global)?,
                None => PulseToml::default(),
            }
        };
        toml.apply_env();

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            verbose: false,
            cli_worker_url: None,
        })
    }

    /// Create PulseConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        verbose: bool,
        worker_url: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        config.cli_worker_url = worker_url;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn data_dir(&self) -> PathBuf {
        match self.toml.worker.data_dir {
            Some(ref dir) if dir.is_absolute() => dir.clone(),
            Some(ref dir) => self.project_dir.join(dir),
            None => self.config_dir.join("data"),
        }
    }

    pub fn checkpoint_db(&self) -> PathBuf {
        self.data_dir().join("checkpoints.db")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir().join("pages")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir().join("worker.lock")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.toml.worker.bind, self.toml.worker.port)
    }

    /// Worker address for CLI commands (CLI flag → env/file → bind address).
    pub fn worker_url(&self) -> String {
        self.cli_worker_url
            .clone()
            .or_else(|| self.toml.worker.url.clone())
            .unwrap_or_else(|| format!("http://{}", self.bind_addr()))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
