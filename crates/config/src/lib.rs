//! Executor configuration, loaded from a YAML file on disk.
//!
//! ```yaml
//! owner: executor-01
//! spin_interval_ms: 2000
//! abort_grace_secs: 60
//! skip_subtask_abortable_check: true
//! shutdown_default_timeout_secs: 30
//! logging:
//!   max_level: INFO
//! ```

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExecutorSettings {
    /// Identifies the host/process running this executor, attached to every
    /// task record it creates.
    pub owner: String,

    #[serde(default = "default_spin_interval_ms")]
    pub spin_interval_ms: u64,

    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,

    #[serde(default = "default_skip_subtask_abortable_check")]
    pub skip_subtask_abortable_check: bool,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_default_timeout_secs: u64,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_spin_interval_ms() -> u64 {
    2000
}

fn default_abort_grace_secs() -> u64 {
    60
}

fn default_skip_subtask_abortable_check() -> bool {
    true
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl ExecutorSettings {
    pub fn spin_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.spin_interval_ms)
    }

    pub fn abort_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.abort_grace_secs)
    }

    pub fn shutdown_default_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_default_timeout_secs)
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            owner: "local".to_string(),
            spin_interval_ms: default_spin_interval_ms(),
            abort_grace_secs: default_abort_grace_secs(),
            skip_subtask_abortable_check: default_skip_subtask_abortable_check(),
            shutdown_default_timeout_secs: default_shutdown_timeout_secs(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub enum LoggingLevel {
    ERROR,
    WARN,
    #[default]
    INFO,
    DEBUG,
    TRACE,
    OFF,
}

impl<'de> Deserialize<'de> for LoggingLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = String::deserialize(deserializer)?;

        Ok(match v.as_str() {
            "ERROR" => Self::ERROR,
            "WARN" => Self::WARN,
            "INFO" => Self::INFO,
            "DEBUG" => Self::DEBUG,
            "TRACE" => Self::TRACE,
            "OFF" => Self::OFF,
            other => Err(serde::de::Error::custom(format!(
                "Bad logging level specifier {other}"
            )))?,
        })
    }
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::ERROR => LevelFilter::ERROR,
            LoggingLevel::WARN => LevelFilter::WARN,
            LoggingLevel::INFO => LevelFilter::INFO,
            LoggingLevel::DEBUG => LevelFilter::DEBUG,
            LoggingLevel::TRACE => LevelFilter::TRACE,
            LoggingLevel::OFF => LevelFilter::OFF,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub max_level: LoggingLevel,
}

static CONFIG: once_cell::sync::Lazy<ExecutorSettings> = once_cell::sync::Lazy::new(|| {
    config::Config::builder()
        .add_source(config::File::with_name("config_data/config.yaml"))
        .build()
        .expect("couldn't load config file")
        .try_deserialize()
        .expect("couldn't load config file, invalid format")
});

/// Global settings loaded from `config_data/config.yaml` the first time they're touched.
///
/// Prefer [`ExecutorSettings::default`] or a literal struct when embedding the
/// executor in a test or another binary; this is for the demo binary only.
pub fn settings() -> &'static ExecutorSettings {
    &CONFIG
}
