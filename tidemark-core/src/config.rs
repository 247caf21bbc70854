//! Recorder configuration and run files.
//!
//! A run file is TOML:
//!
//! ```toml
//! data_dir = "data"
//!
//! [[datasets]]
//! name = "stock_1d_kdata"
//! providers = ["csv"]
//! entity_type = "stock"
//!
//! [[datasets.schemas]]
//! table = "stock_1d_kdata"
//! entity_type = "stock"
//! level = "1d"
//! columns = [{ name = "close", type = "float" }]
//!
//! [recorder]
//! provider = "csv"
//! dataset = "stock_1d_kdata"
//! entity_type = "stock"
//! level = "1d"
//!
//! [calendar.close_times]
//! sh = "07:00:00"
//! ```

use crate::calendar::MarketCalendar;
use crate::domain::{EntityType, Level};
use crate::registry::DatasetSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which of start / end / size / timestamps a source accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchingStyle {
    ByStart,
    ByEnd,
    ByStartEnd,
    BySize,
    #[default]
    ByStartSize,
    ByEndSize,
    ByTimestamps,
}

impl FetchingStyle {
    pub fn uses_start(&self) -> bool {
        matches!(
            self,
            FetchingStyle::ByStart | FetchingStyle::ByStartEnd | FetchingStyle::ByStartSize
        )
    }

    pub fn uses_end(&self) -> bool {
        matches!(
            self,
            FetchingStyle::ByEnd | FetchingStyle::ByStartEnd | FetchingStyle::ByEndSize
        )
    }

    pub fn uses_size(&self) -> bool {
        matches!(
            self,
            FetchingStyle::BySize | FetchingStyle::ByStartSize | FetchingStyle::ByEndSize
        )
    }
}

/// Whether records are stamped with the start or the end of their period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampConvention {
    #[default]
    PeriodStart,
    PeriodEnd,
}

/// What a failing entity does to the rest of the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the pass and retry every remaining entity next pass.
    #[default]
    AbortPass,
    /// Requeue only the failing entity, with backoff.
    Isolate,
}

/// Per-recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub provider: String,
    /// Provider whose catalog lists the entities; defaults to `provider`.
    #[serde(default)]
    pub entity_provider: Option<String>,
    pub dataset: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub exchanges: Vec<String>,
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub force_update: bool,
    /// Pause between entities, in seconds.
    #[serde(default = "default_sleeping_time")]
    pub sleeping_time: f64,
    #[serde(default)]
    pub fetching_style: FetchingStyle,
    #[serde(default = "default_size")]
    pub default_size: usize,
    #[serde(default = "default_level")]
    pub level: Level,
    #[serde(default)]
    pub contain_unfinished_period: bool,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub timestamp_convention: TimestampConvention,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Longest single wait for a period boundary before giving up on an entity.
    #[serde(default = "default_max_boundary_wait_secs")]
    pub max_boundary_wait_secs: u64,
}

fn default_sleeping_time() -> f64 {
    10.0
}

fn default_size() -> usize {
    2000
}

fn default_level() -> Level {
    Level::Day1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_max_boundary_wait_secs() -> u64 {
    0
}

impl RecorderConfig {
    pub fn new(provider: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            entity_provider: None,
            dataset: dataset.into(),
            table: None,
            entity_type: None,
            exchanges: Vec::new(),
            codes: Vec::new(),
            ids: Vec::new(),
            force_update: false,
            sleeping_time: default_sleeping_time(),
            fetching_style: FetchingStyle::default(),
            default_size: default_size(),
            level: default_level(),
            contain_unfinished_period: false,
            one_shot: false,
            timestamp_convention: TimestampConvention::default(),
            failure_policy: FailurePolicy::default(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_boundary_wait_secs: default_max_boundary_wait_secs(),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&read(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.is_empty() {
            return Err(ConfigError::Invalid("provider must not be empty".into()));
        }
        if self.dataset.is_empty() {
            return Err(ConfigError::Invalid("dataset must not be empty".into()));
        }
        if self.default_size == 0 {
            return Err(ConfigError::Invalid("default_size must be at least 1".into()));
        }
        if Duration::try_from_secs_f64(self.sleeping_time).is_err() {
            return Err(ConfigError::Invalid(format!(
                "sleeping_time must be a non-negative number of seconds, got {}",
                self.sleeping_time
            )));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry_base_delay_ms must not exceed retry_max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Catalog provider, falling back to the data provider.
    pub fn entity_provider(&self) -> &str {
        self.entity_provider.as_deref().unwrap_or(&self.provider)
    }

    pub fn sleeping_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.sleeping_time).unwrap_or_default()
    }

    pub fn max_boundary_wait(&self) -> Duration {
        Duration::from_secs(self.max_boundary_wait_secs)
    }
}

/// Everything the CLI needs for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFile {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub calendar: MarketCalendar,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl RunFile {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let run: Self = toml::from_str(content)?;
        run.recorder.validate()?;
        for dataset in &run.datasets {
            for schema in &dataset.schemas {
                schema
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("dataset {}: {e}", dataset.name)))?;
            }
        }
        Ok(run)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&read(path)?)
    }

    /// Resolve a relative `data_dir` against the run file's directory.
    pub fn resolve_data_dir(&mut self, run_file: &Path) {
        if self.data_dir.is_relative() {
            if let Some(parent) = run_file.parent() {
                self.data_dir = parent.join(&self.data_dir);
            }
        }
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = RecorderConfig::from_toml(
            r#"
            provider = "csv"
            dataset = "stock_1d_kdata"
            "#,
        )
        .unwrap();
        assert_eq!(config.entity_provider(), "csv");
        assert_eq!(config.default_size, 2000);
        assert_eq!(config.level, Level::Day1);
        assert_eq!(config.fetching_style, FetchingStyle::ByStartSize);
        assert_eq!(config.failure_policy, FailurePolicy::AbortPass);
        assert!(!config.force_update);
        assert!(!config.contain_unfinished_period);
    }

    #[test]
    fn unrepresentable_sleeping_time_is_rejected() {
        for bad in ["1e20", "-1.0", "nan", "inf"] {
            let content = format!(
                "provider = \"csv\"\ndataset = \"stock_1d_kdata\"\nsleeping_time = {bad}\n"
            );
            let err = RecorderConfig::from_toml(&content).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{bad} accepted");
        }

        let mut config = RecorderConfig::new("csv", "stock_1d_kdata");
        config.sleeping_time = 1e20;
        assert_eq!(config.sleeping_duration(), Duration::ZERO);
    }

    #[test]
    fn zero_default_size_is_rejected() {
        let err = RecorderConfig::from_toml(
            r#"
            provider = "csv"
            dataset = "stock_1d_kdata"
            default_size = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn styles_and_policies_parse_snake_case() {
        let config = RecorderConfig::from_toml(
            r#"
            provider = "csv"
            dataset = "finance"
            fetching_style = "by_timestamps"
            timestamp_convention = "period_end"
            failure_policy = "isolate"
            level = "1wk"
            sleeping_time = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.fetching_style, FetchingStyle::ByTimestamps);
        assert_eq!(config.timestamp_convention, TimestampConvention::PeriodEnd);
        assert_eq!(config.failure_policy, FailurePolicy::Isolate);
        assert_eq!(config.level, Level::Week1);
        assert_eq!(config.sleeping_duration(), Duration::from_millis(500));
    }

    #[test]
    fn style_masks() {
        assert!(FetchingStyle::ByStartSize.uses_start());
        assert!(FetchingStyle::ByStartSize.uses_size());
        assert!(!FetchingStyle::ByStartSize.uses_end());
        assert!(FetchingStyle::ByEnd.uses_end());
        assert!(!FetchingStyle::ByTimestamps.uses_start());
    }

    #[test]
    fn run_file_parses_datasets_and_calendar() {
        let run = RunFile::from_toml(
            r#"
            data_dir = "store"

            [[datasets]]
            name = "stock_1d_kdata"
            providers = ["csv"]
            entity_type = "stock"

            [[datasets.schemas]]
            table = "stock_1d_kdata"
            entity_type = "stock"
            level = "1d"
            columns = [{ name = "close", type = "float" }]

            [recorder]
            provider = "csv"
            dataset = "stock_1d_kdata"

            [calendar.close_times]
            sh = "07:00:00"
            "#,
        )
        .unwrap();
        assert_eq!(run.datasets.len(), 1);
        assert_eq!(run.datasets[0].schemas[0].columns.len(), 1);
        assert!(run.calendar.close_time("sh").is_some());
        assert!(run.calendar.close_time("nyse").is_none());
    }
}
