//! TOML configuration parsing and validation.
//!
//! Every section has defaults, so an empty file (or [`Config::minimal`])
//! yields a working configuration. API keys never live in the file; they
//! are read from the environment (optionally via `.env`):
//!
//! | Variable | Used by |
//! |----------|---------|
//! | `NIXTLA_API_KEY` | [`crate::nixtla::NixtlaClient`] |
//! | `GEMINI_API_KEY` | [`crate::generation::GeminiGenerator`] |
//! | `INFLUXDB_TOKEN` | [`crate::influx::InfluxWriter`] |
//!
//! `INFLUXDB_URL`, `INFLUXDB_ORG` and `INFLUXDB_BUCKET` override the
//! `[influxdb]` section when set.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::preprocess::Frequency;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub influxdb: InfluxConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_anomaly_bind")]
    pub anomaly_bind: String,
    #[serde(default = "default_ask_bind")]
    pub ask_bind: String,
    #[serde(default = "default_assistant_bind")]
    pub assistant_bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            anomaly_bind: default_anomaly_bind(),
            ask_bind: default_ask_bind(),
            assistant_bind: default_assistant_bind(),
        }
    }
}

fn default_anomaly_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_ask_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_assistant_bind() -> String {
    "0.0.0.0:5001".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_plots_dir")]
    pub plots_dir: PathBuf,
    /// Request body limit for `/load_dataset`.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            plots_dir: default_plots_dir(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_plots_dir() -> PathBuf {
    PathBuf::from("/tmp/plots")
}
fn default_max_upload_bytes() -> usize {
    1 << 30
}

/// Settings for the hosted anomaly-detection API.
#[derive(Debug, Deserialize, Clone)]
pub struct AnomalyConfig {
    #[serde(default = "default_anomaly_api_url")]
    pub api_url: String,
    #[serde(default = "default_anomaly_model")]
    pub model: String,
    /// Confidence level (percent) of the prediction interval.
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default = "default_date_features")]
    pub date_features: Vec<String>,
    #[serde(default = "default_true")]
    pub date_features_to_one_hot: bool,
    #[serde(default = "default_anomaly_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            api_url: default_anomaly_api_url(),
            model: default_anomaly_model(),
            level: default_level(),
            date_features: default_date_features(),
            date_features_to_one_hot: true,
            timeout_secs: default_anomaly_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_anomaly_api_url() -> String {
    "https://api.nixtla.io".to_string()
}
fn default_anomaly_model() -> String {
    "timegpt-1".to_string()
}
fn default_level() -> u8 {
    85
}
fn default_date_features() -> Vec<String> {
    vec!["hour".to_string(), "day".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_anomaly_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

/// Column names and resampling frequency used when a request omits them.
#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    #[serde(default = "default_timestamp_col")]
    pub timestamp_col: String,
    #[serde(default = "default_value_col")]
    pub value_col: String,
    #[serde(default = "default_freq")]
    pub freq: String,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            timestamp_col: default_timestamp_col(),
            value_col: default_value_col(),
            freq: default_freq(),
        }
    }
}

fn default_timestamp_col() -> String {
    "Stime".to_string()
}
fn default_value_col() -> String {
    "Dload".to_string()
}
fn default_freq() -> String {
    "1min".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfluxConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    /// Column holding Unix-second timestamps. Rows without one (or every
    /// row, when the column is absent or set to `""`) are stamped from the
    /// ingestion start time; see [`crate::influx::build_points`].
    #[serde(default = "default_influx_timestamp_col")]
    pub timestamp_col: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: None,
            org: None,
            bucket: default_bucket(),
            measurement: default_measurement(),
            timestamp_col: default_influx_timestamp_col(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_bucket() -> String {
    "network_features".to_string()
}
fn default_measurement() -> String {
    "network_features".to_string()
}
fn default_influx_timestamp_col() -> Option<String> {
    Some(default_timestamp_col())
}
fn default_batch_size() -> usize {
    5000
}

/// Hosted generative-language API used by the `ask` service.
#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_api_url")]
    pub api_url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// Only the first `max_rows` rows of an uploaded file are searched.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: default_chat_api_url(),
            model: default_chat_model(),
            max_rows: default_max_rows(),
            top_n: default_top_n(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_chat_api_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_chat_model() -> String {
    "gemini-pro".to_string()
}
fn default_max_rows() -> usize {
    20000
}
fn default_top_n() -> usize {
    3
}

/// Locally served causal language model used by the `assistant` service.
#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_dataset_path")]
    pub dataset_path: PathBuf,
    #[serde(default = "default_assistant_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_assistant_model")]
    pub model: String,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_top_n")]
    pub top_k: usize,
    #[serde(default = "default_assistant_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            endpoint: default_assistant_endpoint(),
            model: default_assistant_model(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_n(),
            timeout_secs: default_assistant_timeout_secs(),
        }
    }
}

fn default_dataset_path() -> PathBuf {
    PathBuf::from("./data/dataset.csv")
}
fn default_assistant_endpoint() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_assistant_model() -> String {
    "deepseek-ai/deepseek-coder-1.3b-base".to_string()
}
fn default_max_new_tokens() -> u32 {
    500
}
fn default_temperature() -> f64 {
    0.7
}
fn default_top_p() -> f64 {
    0.9
}
fn default_assistant_timeout_secs() -> u64 {
    120
}

impl Config {
    /// All-defaults configuration, used when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Parsed resampling frequency from `[preprocess].freq`.
    pub fn frequency(&self) -> Result<Frequency> {
        self.preprocess.freq.parse()
    }

    /// Applies `INFLUXDB_*` environment overrides.
    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("INFLUXDB_URL") {
            self.influxdb.url = Some(url);
        }
        if let Ok(org) = std::env::var("INFLUXDB_ORG") {
            self.influxdb.org = Some(org);
        }
        if let Ok(bucket) = std::env::var("INFLUXDB_BUCKET") {
            self.influxdb.bucket = bucket;
        }
    }
}

/// Loads the config file at `path`, falling back to defaults when the file
/// does not exist, then validates it.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::minimal()
    };

    config.apply_env();
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if !(1..=99).contains(&config.anomaly.level) {
        anyhow::bail!("anomaly.level must be in [1, 99]");
    }

    config
        .frequency()
        .with_context(|| format!("invalid preprocess.freq '{}'", config.preprocess.freq))?;

    for feature in &config.anomaly.date_features {
        match feature.as_str() {
            "hour" | "day" => {}
            other => anyhow::bail!(
                "Unknown date feature: '{}'. Must be hour or day.",
                other
            ),
        }
    }

    if config.chat.max_rows == 0 {
        anyhow::bail!("chat.max_rows must be >= 1");
    }
    if config.chat.top_n == 0 {
        anyhow::bail!("chat.top_n must be >= 1");
    }
    if config.assistant.top_k == 0 {
        anyhow::bail!("assistant.top_k must be >= 1");
    }
    if config.storage.max_upload_bytes == 0 {
        anyhow::bail!("storage.max_upload_bytes must be >= 1");
    }
    if config.influxdb.batch_size == 0 {
        anyhow::bail!("influxdb.batch_size must be >= 1");
    }

    if config.assistant.temperature <= 0.0 {
        anyhow::bail!("assistant.temperature must be > 0");
    }
    if !(config.assistant.top_p > 0.0 && config.assistant.top_p <= 1.0) {
        anyhow::bail!("assistant.top_p must be in (0.0, 1.0]");
    }

    Ok(())
}
