use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::analysis::{BodySystem, MAX_ARTIFACTS, MIN_HEALTH_SCORE, ZONE_COUNT};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for IrisScope
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IrisScopeConfig {
    /// LLM provider configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Stage execution settings (retries, pacing, quality gate)
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Thresholds and weights used to turn findings into zones and scores
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// How per-side failures affect the final report
    #[serde(default)]
    pub report: ReportConfig,

    /// Where reports are persisted
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prompt template overrides
    #[serde(default)]
    pub prompts: PromptConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM configuration for the analysis stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// LLM provider: "openai", "openai-compatible", "lmstudio", "ollama"
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model identifier, must accept image input
    /// For OpenAI: model name (e.g., "gpt-4o")
    /// For Ollama: model name (e.g., "llava:13b")
    /// For OpenAI-compatible: custom model name
    #[serde(default)]
    pub model: Option<String>,

    /// OpenAI API base URL
    #[serde(default = "default_openai_url")]
    pub openai_url: String,

    /// OpenAI-compatible base URL (for custom endpoints)
    #[serde(default)]
    pub openai_compatible_url: Option<String>,

    /// LM Studio URL
    #[serde(default = "default_lmstudio_url")]
    pub lmstudio_url: String,

    /// Ollama URL
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// OpenAI API key
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Image detail hint sent with vision requests: "low", "high", "auto"
    #[serde(default = "default_image_detail")]
    pub image_detail: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            openai_url: default_openai_url(),
            openai_compatible_url: None,
            lmstudio_url: default_lmstudio_url(),
            ollama_url: default_ollama_url(),
            openai_api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            image_detail: default_image_detail(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Stage execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retries per stage after the first attempt
    #[serde(default = "default_stage_retries")]
    pub stage_retries: u32,

    /// Delay before every gateway call, to respect provider rate limits
    #[serde(default)]
    pub request_delay_ms: u64,

    /// Base for exponential backoff between retries
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Calibrations with ok=true but a quality score below this are rejected.
    /// 0 disables the extra gate.
    #[serde(default)]
    pub min_quality_score: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_retries: default_stage_retries(),
            request_delay_ms: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            min_quality_score: 0.0,
        }
    }
}

/// Zone ids (1..=12) that feed each body system score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemZoneMap {
    pub digestive: Vec<u8>,
    pub immune: Vec<u8>,
    pub nervous: Vec<u8>,
    pub cardiovascular: Vec<u8>,
    pub detox: Vec<u8>,
    pub endocrine: Vec<u8>,
}

impl SystemZoneMap {
    pub fn zones_for(&self, system: BodySystem) -> &[u8] {
        match system {
            BodySystem::Digestive => &self.digestive,
            BodySystem::Immune => &self.immune,
            BodySystem::Nervous => &self.nervous,
            BodySystem::Cardiovascular => &self.cardiovascular,
            BodySystem::Detox => &self.detox,
            BodySystem::Endocrine => &self.endocrine,
        }
    }
}

impl Default for SystemZoneMap {
    fn default() -> Self {
        Self {
            digestive: vec![5, 6, 7],
            immune: vec![4, 8, 10],
            nervous: vec![1, 2, 12],
            cardiovascular: vec![3, 4, 11],
            detox: vec![5, 8, 9],
            endocrine: vec![1, 3, 9],
        }
    }
}

/// Tuning parameters for the finding aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Findings below this confidence never become artifacts
    #[serde(default = "default_min_artifact_confidence")]
    pub min_artifact_confidence: f64,

    /// A zone is a concern when any finding is above this confidence (or high severity)
    #[serde(default = "default_concern_confidence")]
    pub concern_confidence: f64,

    #[serde(default = "default_max_artifacts")]
    pub max_artifacts: usize,

    #[serde(default = "default_base_system_score")]
    pub base_system_score: i32,

    #[serde(default = "default_system_concern_penalty")]
    pub system_concern_penalty: i32,

    #[serde(default = "default_system_attention_penalty")]
    pub system_attention_penalty: i32,

    #[serde(default = "default_overall_concern_penalty")]
    pub overall_concern_penalty: i32,

    #[serde(default = "default_overall_attention_penalty")]
    pub overall_attention_penalty: i32,

    #[serde(default = "default_min_score")]
    pub min_score: u8,

    #[serde(default = "default_max_score")]
    pub max_score: u8,

    #[serde(default)]
    pub system_zones: SystemZoneMap,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_artifact_confidence: default_min_artifact_confidence(),
            concern_confidence: default_concern_confidence(),
            max_artifacts: default_max_artifacts(),
            base_system_score: default_base_system_score(),
            system_concern_penalty: default_system_concern_penalty(),
            system_attention_penalty: default_system_attention_penalty(),
            overall_concern_penalty: default_overall_concern_penalty(),
            overall_attention_penalty: default_overall_attention_penalty(),
            min_score: default_min_score(),
            max_score: default_max_score(),
            system_zones: SystemZoneMap::default(),
        }
    }
}

/// What to do when one side fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartialReportPolicy {
    /// Any failed side aborts the whole report
    #[default]
    RequireBoth,
    /// Keep the report as long as one side completed
    AllowPartial,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReportConfig {
    #[serde(default)]
    pub partial_policy: PartialReportPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Directory for persisted reports (defaults to ~/.irisscope/data)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".irisscope")
                .join("data")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptConfig {
    /// Directory holding `<stage_id>.txt` files that replace built-in templates
    #[serde(default)]
    pub overrides_dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error", or an EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_lmstudio_url() -> String {
    "http://localhost:1234".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_temperature() -> f32 {
    0.0
} // Repeatable stage outputs
fn default_max_tokens() -> usize {
    4096
}
fn default_image_detail() -> String {
    "high".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_stage_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_min_artifact_confidence() -> f64 {
    0.6
}
fn default_concern_confidence() -> f64 {
    0.8
}
fn default_max_artifacts() -> usize {
    5
}
/// Per-zone penalty ceiling; twelve zones at this penalty stay far inside `i32`
const MAX_PENALTY: i32 = 100;

fn default_base_system_score() -> i32 {
    85
}
fn default_system_concern_penalty() -> i32 {
    15
}
fn default_system_attention_penalty() -> i32 {
    8
}
fn default_overall_concern_penalty() -> i32 {
    5
}
fn default_overall_attention_penalty() -> i32 {
    2
}
fn default_min_score() -> u8 {
    30
}
fn default_max_score() -> u8 {
    100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager with layered loading
pub struct ConfigManager {
    config: IrisScopeConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.irisscope.toml)
    /// 3. Sensible defaults
    pub fn load() -> Result<Self, ConfigError> {
        info!("Loading IrisScope configuration...");

        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;

        if let Some(ref path) = config_path {
            info!("Config file: {}", path.display());
        } else {
            info!("Config file: NONE (using defaults)");
        }
        info!(
            "LLM provider: {} (model: {:?})",
            config.llm.provider, config.llm.model
        );
        info!(
            "Stage retries: {}, request delay: {}ms",
            config.pipeline.stage_retries, config.pipeline.request_delay_ms
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load an explicit config file, still applying environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_dotenv();
        let config = Self::read_toml_file(path)?;
        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load .env file if it exists
    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            } else {
                info!("Loaded .env file from current directory");
            }
            return;
        }

        if let Some(home) = dirs::home_dir() {
            let home_env = home.join(".irisscope.env");
            if home_env.exists() {
                if let Err(e) = dotenv::from_path(&home_env) {
                    warn!("Failed to load .irisscope.env: {}", e);
                } else {
                    info!("Loaded .irisscope.env from home directory");
                }
            }
        }
    }

    /// Find and load config file
    /// Search order:
    /// 1. ./.irisscope.toml (current directory)
    /// 2. ~/.irisscope/config.toml (user config)
    /// 3. Use defaults
    fn load_config_file() -> Result<(IrisScopeConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".irisscope.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".irisscope").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        info!("No config file found, using defaults");
        Ok((IrisScopeConfig::default(), None))
    }

    /// Read TOML config file
    fn read_toml_file(path: &Path) -> Result<IrisScopeConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply environment variable overrides, looked up through `var`
    fn apply_env_overrides<F>(mut config: IrisScopeConfig, var: F) -> IrisScopeConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        // LLM configuration
        if let Some(provider) = var("IRISSCOPE_LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Some(model) = var("IRISSCOPE_MODEL") {
            config.llm.model = Some(model);
        }
        if let Some(url) = var("IRISSCOPE_LLM_URL") {
            config.llm.openai_compatible_url = Some(url);
        }
        if let Some(key) = var("OPENAI_API_KEY") {
            config.llm.openai_api_key = Some(key);
        }
        if let Some(timeout) = var("IRISSCOPE_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                config.llm.timeout_secs = secs;
            }
        }

        // Pipeline pacing
        if let Some(retries) = var("IRISSCOPE_STAGE_RETRIES") {
            if let Ok(n) = retries.parse() {
                config.pipeline.stage_retries = n;
            }
        }
        if let Some(delay) = var("IRISSCOPE_REQUEST_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                config.pipeline.request_delay_ms = ms;
            }
        }

        // Report and storage
        if let Some(partial) = var("IRISSCOPE_ALLOW_PARTIAL") {
            if partial.to_lowercase() == "true" || partial == "1" {
                config.report.partial_policy = PartialReportPolicy::AllowPartial;
            }
        }
        if let Some(dir) = var("IRISSCOPE_DATA_DIR") {
            config.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = var("IRISSCOPE_PROMPTS_DIR") {
            config.prompts.overrides_dir = Some(PathBuf::from(dir));
        }

        // Logging
        if let Some(level) = var("RUST_LOG") {
            config.logging.level = level;
        }
        if let Some(format) = var("IRISSCOPE_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    /// Validate configuration
    fn validate_config(config: &IrisScopeConfig) -> Result<(), ConfigError> {
        match config.llm.provider.as_str() {
            "openai" | "openai-compatible" | "lmstudio" | "ollama" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid LLM provider: {}. Must be one of: openai, openai-compatible, lmstudio, ollama",
                    other
                )))
            }
        }

        match config.llm.image_detail.as_str() {
            "low" | "high" | "auto" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid image detail: {}. Must be one of: low, high, auto",
                    other
                )))
            }
        }

        if !(0.0..=100.0).contains(&config.pipeline.min_quality_score) {
            return Err(ConfigError::ValidationError(format!(
                "min_quality_score must be within 0..=100, got {}",
                config.pipeline.min_quality_score
            )));
        }

        Self::validate_aggregation(&config.aggregation)?;

        // Plain levels or EnvFilter directives such as "irisscope_ai=debug"
        let level = config.logging.level.as_str();
        if !level.contains('=') {
            match level {
                "trace" | "debug" | "info" | "warn" | "error" => {}
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                        other
                    )))
                }
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    fn validate_aggregation(agg: &AggregationConfig) -> Result<(), ConfigError> {
        for (name, value) in [
            ("min_artifact_confidence", agg.min_artifact_confidence),
            ("concern_confidence", agg.concern_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be within 0..=1, got {}",
                    name, value
                )));
            }
        }

        if agg.max_artifacts == 0 || agg.max_artifacts > MAX_ARTIFACTS {
            return Err(ConfigError::ValidationError(format!(
                "max_artifacts must be within 1..={}, got {}",
                MAX_ARTIFACTS, agg.max_artifacts
            )));
        }

        if agg.min_score < MIN_HEALTH_SCORE || agg.min_score > agg.max_score || agg.max_score > 100
        {
            return Err(ConfigError::ValidationError(format!(
                "score bounds must satisfy {} <= min <= max <= 100, got {}..={}",
                MIN_HEALTH_SCORE, agg.min_score, agg.max_score
            )));
        }

        if !(0..=100).contains(&agg.base_system_score) {
            return Err(ConfigError::ValidationError(format!(
                "base_system_score must be within 0..=100, got {}",
                agg.base_system_score
            )));
        }

        for (name, value) in [
            ("system_concern_penalty", agg.system_concern_penalty),
            ("system_attention_penalty", agg.system_attention_penalty),
            ("overall_concern_penalty", agg.overall_concern_penalty),
            ("overall_attention_penalty", agg.overall_attention_penalty),
        ] {
            if !(0..=MAX_PENALTY).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be within 0..={}, got {}",
                    name, MAX_PENALTY, value
                )));
            }
        }

        for system in BodySystem::ALL {
            for &zone in agg.system_zones.zones_for(system) {
                if zone == 0 || zone as usize > ZONE_COUNT {
                    return Err(ConfigError::ValidationError(format!(
                        "system {} maps to invalid zone {}",
                        system, zone
                    )));
                }
            }
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &IrisScopeConfig {
        &self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = IrisScopeConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
