// src/config.rs
// File-based configuration from ~/.hivemind/config.toml with env overrides

use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct HivemindConfig {
    /// Data root for conversation blobs, summaries, and the activity log
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub brain: BrainConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
}

/// Storage backend selection and SQLite tuning
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// 'local', 'remote', or 'cache'
    #[serde(default = "StorageConfig::default_primary_backend")]
    pub primary_backend: String,
    #[serde(default = "StorageConfig::default_local_db_path")]
    pub local_db_path: PathBuf,
    #[serde(default = "StorageConfig::default_enable_wal")]
    pub enable_wal: bool,
    /// SQLite page cache; negative values are KiB
    #[serde(default = "StorageConfig::default_cache_size")]
    pub cache_size: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_backend: Self::default_primary_backend(),
            local_db_path: Self::default_local_db_path(),
            enable_wal: Self::default_enable_wal(),
            cache_size: Self::default_cache_size(),
        }
    }
}

impl StorageConfig {
    fn default_primary_backend() -> String {
        "local".to_string()
    }
    fn default_local_db_path() -> PathBuf {
        PathBuf::from("data/hivemind.db")
    }
    fn default_enable_wal() -> bool {
        true
    }
    fn default_cache_size() -> i64 {
        -64000
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.primary_backend.as_str() {
            "local" | "remote" | "cache" => Ok(()),
            other => Err(format!("invalid primary_backend: {other}")),
        }
    }
}

/// Brain-level policy: identity overrides and worker toggles
#[derive(Debug, Deserialize, Clone)]
pub struct BrainConfig {
    /// Auto-generated from hostname + MAC when unset
    pub device_id: Option<String>,
    /// Auto-detected when unset
    pub device_name: Option<String>,
    #[serde(default = "BrainConfig::default_device_location")]
    pub device_location: String,
    #[serde(default = "BrainConfig::default_enable_sync")]
    pub enable_sync: bool,
    /// Sync worker tick, in seconds
    #[serde(default = "BrainConfig::default_sync_interval")]
    pub sync_interval: u64,
    #[serde(default = "BrainConfig::default_enable_summarizer")]
    pub enable_summarizer: bool,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            device_location: Self::default_device_location(),
            enable_sync: Self::default_enable_sync(),
            sync_interval: Self::default_sync_interval(),
            enable_summarizer: Self::default_enable_summarizer(),
        }
    }
}

impl BrainConfig {
    fn default_device_location() -> String {
        "unknown".to_string()
    }
    fn default_enable_sync() -> bool {
        true
    }
    fn default_sync_interval() -> u64 {
        30
    }
    fn default_enable_summarizer() -> bool {
        true
    }
}

/// Summarizer worker triggers and generator parameters
#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default = "SummarizerConfig::default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "SummarizerConfig::default_max_age_days")]
    pub max_age_days: u64,
    #[serde(default = "SummarizerConfig::default_monitoring_interval_seconds")]
    pub monitoring_interval_seconds: u64,
    #[serde(default = "SummarizerConfig::default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "SummarizerConfig::default_max_summary_tokens")]
    pub max_summary_tokens: u32,
    #[serde(default = "SummarizerConfig::default_temperature")]
    pub temperature: f32,
    /// Archive originals after summarization instead of deleting them
    #[serde(default = "SummarizerConfig::default_keep_originals")]
    pub keep_originals: bool,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: Self::default_max_file_size_bytes(),
            max_age_days: Self::default_max_age_days(),
            monitoring_interval_seconds: Self::default_monitoring_interval_seconds(),
            max_context_tokens: Self::default_max_context_tokens(),
            max_summary_tokens: Self::default_max_summary_tokens(),
            temperature: Self::default_temperature(),
            keep_originals: Self::default_keep_originals(),
        }
    }
}

impl SummarizerConfig {
    fn default_max_file_size_bytes() -> u64 {
        50 * 1024
    }
    fn default_max_age_days() -> u64 {
        7
    }
    fn default_monitoring_interval_seconds() -> u64 {
        300
    }
    fn default_max_context_tokens() -> usize {
        6000
    }
    fn default_max_summary_tokens() -> u32 {
        500
    }
    fn default_temperature() -> f32 {
        0.3
    }
    fn default_keep_originals() -> bool {
        true
    }
}

/// Text generator endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "GeneratorConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "GeneratorConfig::default_model")]
    pub model: String,
    /// Env var holding the API key (never the key itself)
    #[serde(default = "GeneratorConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "GeneratorConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            api_key_env: Self::default_api_key_env(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

impl GeneratorConfig {
    fn default_base_url() -> String {
        "https://openrouter.ai/api/v1".to_string()
    }
    fn default_model() -> String {
        "meta-llama/llama-3.3-8b-instruct:free".to_string()
    }
    fn default_api_key_env() -> String {
        "OPENROUTER_API_KEY".to_string()
    }
    fn default_timeout_secs() -> u64 {
        60
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|s| !s.is_empty())
    }
}

/// Embedding provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingsConfig {
    #[serde(default = "EmbeddingsConfig::default_model")]
    pub model: String,
    /// Fixed embedding dimension D for this deployment
    #[serde(default = "EmbeddingsConfig::default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "EmbeddingsConfig::default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "EmbeddingsConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            dimensions: Self::default_dimensions(),
            api_key_env: Self::default_api_key_env(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

impl EmbeddingsConfig {
    fn default_model() -> String {
        "text-embedding-3-small".to_string()
    }
    fn default_dimensions() -> usize {
        1536
    }
    fn default_api_key_env() -> String {
        "OPENAI_API_KEY".to_string()
    }
    fn default_timeout_secs() -> u64 {
        30
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|s| !s.is_empty())
    }
}

impl HivemindConfig {
    /// Load config from the default path, falling back to defaults when the
    /// file is missing or malformed.
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config
    }

    /// Environment variables override file values. Reads happen once here;
    /// nothing else in the crate touches the environment for configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HIVEMIND_DB_PATH")
            && !v.is_empty()
        {
            self.storage.local_db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("HIVEMIND_DATA_DIR")
            && !v.is_empty()
        {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("HIVEMIND_STORAGE_BACKEND")
            && !v.is_empty()
        {
            self.storage.primary_backend = v;
        }
        if let Some(v) = parse_bool_env("HIVEMIND_ENABLE_SYNC") {
            self.brain.enable_sync = v;
        }
        if let Some(v) = parse_bool_env("HIVEMIND_ENABLE_SUMMARIZER") {
            self.brain.enable_summarizer = v;
        }
        if let Ok(v) = std::env::var("HIVEMIND_GENERATOR_MODEL")
            && !v.is_empty()
        {
            self.generator.model = v;
        }
        if let Ok(v) = std::env::var("HIVEMIND_EMBEDDINGS_DIM")
            && let Ok(dim) = v.parse()
        {
            self.embeddings.dimensions = dim;
        }
    }

    /// Resolved data root: explicit setting, else ~/.hivemind/data.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| Self::home_dir().join(".hivemind").join("data"))
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        Self::home_dir().join(".hivemind").join("config.toml")
    }

    fn home_dir() -> PathBuf {
        dirs::home_dir().unwrap_or_else(|| {
            warn!("HOME directory not set, using current directory");
            PathBuf::from(".")
        })
    }
}

/// Parse a boolean env var ("1"/"true"/"yes" → true, "0"/"false"/"no" → false)
fn parse_bool_env(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
