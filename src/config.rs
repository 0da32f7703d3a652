// Learning Loop Configuration
//
// Defines configuration for the scheduler, the training pipeline and the
// two learners. Files are TOML; durations are expressed in seconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::AsclepiusError;

/// Longest lookback or retention window accepted, in days (100 years)
pub const MAX_WINDOW_DAYS: i64 = 36_500;

/// Environment variable prefix for overrides, e.g. `ASCLEPIUS__SCHEDULER__THRESHOLD=25`
pub const ENV_PREFIX: &str = "ASCLEPIUS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to load layered config: {0}")]
    SourceError(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for AsclepiusError {
    fn from(err: ConfigError) -> Self {
        AsclepiusError::Config(err.to_string())
    }
}

/// Main learning loop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub q_learning: QLearningConfig,

    #[serde(default)]
    pub bandit: BanditConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub catalogue: CatalogueConfig,
}

/// Periodic retraining check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Start the background loop when serving
    pub enabled: bool,

    /// Interval between checks (in seconds)
    #[serde(with = "serde_duration")]
    pub interval: Duration,

    /// Minimum new outcome records since the last completed session
    pub threshold: u64,

    /// Approve sessions that improved accuracy without human review
    pub auto_approve: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(604800), // 7 days
            threshold: 50,
            auto_approve: false,
        }
    }
}

/// Which case source a training session draws from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSourceMode {
    /// Stored cases, synthetic cases when the store is empty or unreachable
    #[default]
    StoreWithFallback,

    /// Stored cases only; an empty store yields an empty batch
    StoreOnly,

    /// Synthetic cases only (dry runs, demos)
    SyntheticOnly,
}

/// Training session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of cases processed per session
    pub batch_size: usize,

    /// Window of outcome records used to measure accuracy
    pub accuracy_lookback_days: i64,

    /// Window of stored cases eligible for a batch
    pub case_lookback_days: i64,

    /// Upper bound on a single inference call (in seconds)
    #[serde(with = "serde_duration")]
    pub inference_timeout: Duration,

    /// Upper bound on a single store call (in seconds)
    #[serde(with = "serde_duration", default = "default_store_timeout")]
    pub store_timeout: Duration,

    /// Upper bound on a whole training session (in seconds)
    #[serde(with = "serde_duration", default = "default_session_timeout")]
    pub session_timeout: Duration,

    pub case_source: CaseSourceMode,

    /// Seed for the synthetic case generator
    pub synthetic_seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            accuracy_lookback_days: 7,
            case_lookback_days: 30,
            inference_timeout: Duration::from_secs(30),
            store_timeout: default_store_timeout(),
            session_timeout: default_session_timeout(),
            case_source: CaseSourceMode::StoreWithFallback,
            synthetic_seed: 42,
        }
    }
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(3600) // 1 hour
}

/// Tabular Q-learning hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QLearningConfig {
    /// Alpha
    pub learning_rate: f64,

    /// Gamma
    pub discount_factor: f64,

    /// Epsilon for epsilon-greedy selection
    pub exploration_rate: f64,

    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for QLearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.1,
            seed: None,
        }
    }
}

/// Thompson Sampling bandit settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Fixed RNG seed; entropy-seeded when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Evaluation report settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Number of most-confused label pairs reported
    pub top_confused_pairs: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            top_confused_pairs: 5,
        }
    }
}

/// Outcome record retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Outcome records older than this are purged
    pub outcome_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            outcome_retention_days: 365,
        }
    }
}

/// Candidate diagnoses forming the Q-learning action space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueConfig {
    pub diagnoses: Vec<String>,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            diagnoses: [
                "common_cold",
                "influenza",
                "covid19",
                "pneumonia",
                "bronchitis",
                "asthma",
                "migraine",
                "tension_headache",
                "gastroenteritis",
                "appendicitis",
                "urinary_tract_infection",
                "hypertension",
                "myocardial_infarction",
                "anxiety",
                "allergic_reaction",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl LearningConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: LearningConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional TOML file and `ASCLEPIUS__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: LearningConfig = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Interval must be at least 1 minute
        if self.scheduler.interval < Duration::from_secs(60) {
            return Err(ConfigError::ValidationError(
                "scheduler: interval must be at least 1 minute".to_string(),
            ));
        }

        if self.scheduler.threshold == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler: threshold must be at least 1".to_string(),
            ));
        }

        // Batch size must be reasonable (1-10000)
        if self.pipeline.batch_size == 0 || self.pipeline.batch_size > 10000 {
            return Err(ConfigError::ValidationError(
                "pipeline: batch_size must be between 1 and 10000".to_string(),
            ));
        }

        let lookbacks = [
            self.pipeline.accuracy_lookback_days,
            self.pipeline.case_lookback_days,
        ];
        if lookbacks.iter().any(|days| !(1..=MAX_WINDOW_DAYS).contains(days)) {
            return Err(ConfigError::ValidationError(format!(
                "pipeline: lookback windows must be between 1 and {} days",
                MAX_WINDOW_DAYS
            )));
        }

        if self.pipeline.inference_timeout.is_zero()
            || self.pipeline.store_timeout.is_zero()
            || self.pipeline.session_timeout.is_zero()
        {
            return Err(ConfigError::ValidationError(
                "pipeline: inference, store and session timeouts must be positive".to_string(),
            ));
        }

        let q = &self.q_learning;
        if !(q.learning_rate > 0.0 && q.learning_rate <= 1.0) {
            return Err(ConfigError::ValidationError(
                "q_learning: learning_rate must be in (0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&q.discount_factor) {
            return Err(ConfigError::ValidationError(
                "q_learning: discount_factor must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&q.exploration_rate) {
            return Err(ConfigError::ValidationError(
                "q_learning: exploration_rate must be in [0, 1]".to_string(),
            ));
        }

        if self.evaluation.top_confused_pairs == 0 {
            return Err(ConfigError::ValidationError(
                "evaluation: top_confused_pairs must be at least 1".to_string(),
            ));
        }

        let retention = i64::from(self.retention.outcome_retention_days);
        if !(1..=MAX_WINDOW_DAYS).contains(&retention) {
            return Err(ConfigError::ValidationError(format!(
                "retention: outcome_retention_days must be between 1 and {}",
                MAX_WINDOW_DAYS
            )));
        }

        if self.catalogue.diagnoses.is_empty() {
            return Err(ConfigError::ValidationError(
                "catalogue: at least one diagnosis is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}
