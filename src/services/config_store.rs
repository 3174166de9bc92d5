// Configuration Storage Service
// Handles config file read/write, version backup and environment overrides

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_VERSION: &str = "1.0.0";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub roles: ProviderRoles,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Model id → price per 1k tokens. Entries here override built-in rates.
    #[serde(default)]
    pub rates: HashMap<String, ModelRate>,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            pipeline: PipelineConfig::default(),
            roles: ProviderRoles::default(),
            proxy: None,
            providers: HashMap::new(),
            api_keys: HashMap::new(),
            rates: HashMap::new(),
            history: HistoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub enabled: bool,
    pub http: Option<String>,
    pub https: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub embeddings_url: Option<String>,
}

/// Which `provider[:model]` backs each capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRoles {
    #[serde(default = "default_classifier")]
    pub classifier: String,
    #[serde(default = "default_fallback_classifier")]
    pub fallback_classifier: Option<String>,
    #[serde(default = "default_classifier")]
    pub rewriter: String,
    #[serde(default = "default_embedding")]
    pub embedding: String,
}

impl Default for ProviderRoles {
    fn default() -> Self {
        Self {
            classifier: default_classifier(),
            fallback_classifier: default_fallback_classifier(),
            rewriter: default_classifier(),
            embedding: default_embedding(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRate {
    pub prompt_per1k: f64,
    pub completion_per1k: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to `<data dir>/speechproc/history` when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl HistoryConfig {
    pub fn resolve_dir(&self) -> Option<PathBuf> {
        self.dir
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join("speechproc").join("history")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_score_delta")]
    pub score_delta_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds
    #[serde(default = "default_min_retry_wait")]
    pub min_retry_wait: f64,
    /// Seconds
    #[serde(default = "default_max_retry_wait")]
    pub max_retry_wait: f64,
    /// Seconds, per attempt
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,
    #[serde(default = "default_fallback_cycles")]
    pub max_fallback_cycles: u32,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_min_input_chars")]
    pub min_input_chars: usize,
    #[serde(default = "default_true")]
    pub strict_labels: bool,
    #[serde(default = "default_tokenizer_model")]
    pub tokenizer_model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            chunk_size: default_chunk_size(),
            similarity_threshold: default_similarity_threshold(),
            score_delta_threshold: default_score_delta(),
            max_retries: default_max_retries(),
            min_retry_wait: default_min_retry_wait(),
            max_retry_wait: default_max_retry_wait(),
            request_timeout: default_request_timeout(),
            max_fallback_cycles: default_fallback_cycles(),
            max_concurrency: default_concurrency(),
            min_input_chars: default_min_input_chars(),
            strict_labels: true,
            tokenizer_model: default_tokenizer_model(),
        }
    }
}

fn default_version() -> String { CONFIG_VERSION.to_string() }
fn default_true() -> bool { true }
fn default_classifier() -> String { "openai:gpt-3.5-turbo".to_string() }
fn default_fallback_classifier() -> Option<String> { Some("deepseek:deepseek-chat".to_string()) }
fn default_embedding() -> String { "openai:text-embedding-ada-002".to_string() }
fn default_max_tokens() -> usize { 16000 }
fn default_chunk_size() -> usize { 4000 }
fn default_similarity_threshold() -> f64 { 0.85 }
fn default_score_delta() -> f64 { 0.5 }
fn default_max_retries() -> u32 { 3 }
fn default_min_retry_wait() -> f64 { 1.0 }
fn default_max_retry_wait() -> f64 { 10.0 }
fn default_request_timeout() -> f64 { 60.0 }
fn default_fallback_cycles() -> u32 { 2 }
fn default_concurrency() -> usize { 4 }
fn default_min_input_chars() -> usize { 10 }
fn default_tokenizer_model() -> String { "gpt-3.5-turbo".to_string() }

/// Upper bound in seconds for any wait or timeout setting.
pub const MAX_WAIT_SECS: f64 = 3600.0;

fn parse_override<T: std::str::FromStr>(
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride {
                key: key.to_string(),
                value: raw,
            }),
    }
}

impl PipelineConfig {
    /// Apply `MAX_TOKENS`, `CHUNK_SIZE`, ... from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Apply overrides from an arbitrary lookup. Each key is independent.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = parse_override("MAX_TOKENS", &lookup)? {
            self.max_tokens = v;
        }
        if let Some(v) = parse_override("CHUNK_SIZE", &lookup)? {
            self.chunk_size = v;
        }
        if let Some(v) = parse_override("SIMILARITY_THRESHOLD", &lookup)? {
            self.similarity_threshold = v;
        }
        if let Some(v) = parse_override("SCORE_DELTA_THRESHOLD", &lookup)? {
            self.score_delta_threshold = v;
        }
        if let Some(v) = parse_override("MAX_RETRIES", &lookup)? {
            self.max_retries = v;
        }
        if let Some(v) = parse_override("MIN_RETRY_WAIT", &lookup)? {
            self.min_retry_wait = v;
        }
        if let Some(v) = parse_override("MAX_RETRY_WAIT", &lookup)? {
            self.max_retry_wait = v;
        }
        if let Some(v) = parse_override("REQUEST_TIMEOUT", &lookup)? {
            self.request_timeout = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.max_tokens == 0 || self.chunk_size == 0 {
            return invalid("maxTokens and chunkSize must be positive".to_string());
        }
        if self.max_retries == 0 {
            return invalid("maxRetries must be at least 1".to_string());
        }
        if self.max_concurrency == 0 {
            return invalid("maxConcurrency must be at least 1".to_string());
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return invalid(format!(
                "similarityThreshold {} outside (0, 1]",
                self.similarity_threshold
            ));
        }
        if !(self.score_delta_threshold.is_finite() && self.score_delta_threshold >= 0.0) {
            return invalid(format!(
                "scoreDeltaThreshold {} must be finite and non-negative",
                self.score_delta_threshold
            ));
        }
        for (name, secs, min_exclusive) in [
            ("minRetryWait", self.min_retry_wait, false),
            ("maxRetryWait", self.max_retry_wait, false),
            ("requestTimeout", self.request_timeout, true),
        ] {
            let in_range = secs.is_finite()
                && secs <= MAX_WAIT_SECS
                && if min_exclusive { secs > 0.0 } else { secs >= 0.0 };
            if !in_range {
                return invalid(format!(
                    "{} {} outside {}0, {}]",
                    name,
                    secs,
                    if min_exclusive { "(" } else { "[" },
                    MAX_WAIT_SECS
                ));
            }
        }
        if self.min_retry_wait > self.max_retry_wait {
            return invalid(format!(
                "minRetryWait {} exceeds maxRetryWait {}",
                self.min_retry_wait, self.max_retry_wait
            ));
        }
        Ok(())
    }

    /// Fallback cycle bound, clamped to 1..=3.
    pub fn fallback_cycles(&self) -> u32 {
        self.max_fallback_cycles.clamp(1, 3)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn min_retry_wait(&self) -> Duration {
        Duration::from_secs_f64(self.min_retry_wait)
    }

    pub fn max_retry_wait(&self) -> Duration {
        Duration::from_secs_f64(self.max_retry_wait)
    }
}

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Store backed by an explicit file path (e.g. `--config`).
    pub fn from_file(config_file: PathBuf) -> Self {
        let config_dir = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("speechproc"))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir).map_err(io_err(&self.config_dir))
    }

    /// Load configuration from file
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_file).map_err(io_err(&self.config_file))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load the file, apply environment overrides and validate.
    pub fn load_effective(&self) -> Result<AppConfig, ConfigError> {
        let mut config = self.load()?;
        config.pipeline.apply_env_overrides()?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.ensure_dir()?;

        // Create backup if file exists
        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_file, content).map_err(io_err(&self.config_file))
    }

    /// Create a backup of current config
    fn create_backup(&self) -> Result<(), ConfigError> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir).map_err(io_err(&backup_dir))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file).map_err(io_err(&backup_file))?;

        // Keep only last 10 backups
        self.cleanup_old_backups(&backup_dir, 10)
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), ConfigError> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(io_err(backup_dir))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Names embed the timestamp, so lexical order is age order
        entries.sort_by_key(|e| e.file_name());

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }

    /// Get provider API key from config file
    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let config = self.load()?;
        Ok(config
            .api_keys
            .get(provider)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty()))
    }

    /// Store provider API key in config file
    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&config)
    }

    /// Set provider base URL in config file
    pub fn set_provider_url(&self, provider: &str, url: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        let provider_config = config.providers.entry(provider.to_string()).or_default();
        provider_config.base_url = Some(url.to_string());
        self.save(&config)
    }
}
