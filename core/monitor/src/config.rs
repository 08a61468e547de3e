//! Runtime configuration for the monitor.
//!
//! Loaded from `~/.bomwatch/config.toml` unless a path is given. Every field
//! has a default so a missing file, or a file with only a few keys, is fine.

use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MonitorError, Result};

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".bomwatch/config.toml";
const DEFAULT_DB_RELATIVE_PATH: &str = ".bomwatch/bomwatch.db";

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownProjectPolicy {
    #[default]
    CreatePlaceholder,
    Ignore,
    LogOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_source_warning_after")]
    pub source_warning_after: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            source_warning_after: default_source_warning_after(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StabilityConfig {
    #[serde(default = "default_stability_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_stability_delay_ms")]
    pub delay_ms: u64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_stability_attempts(),
            delay_ms: default_stability_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_max_concurrent_extractions")]
    pub max_concurrent: usize,
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent_extractions(),
            timeout_secs: default_extraction_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_project_patterns")]
    pub project_patterns: Vec<String>,
    #[serde(default)]
    pub unknown_project: UnknownProjectPolicy,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            project_patterns: default_project_patterns(),
            unknown_project: UnknownProjectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_directory_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_directory_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub bridge_command: Option<String>,
    #[serde(default)]
    pub bridge_args: Vec<String>,
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bridge_command: None,
            bridge_args: Vec::new(),
            timeout_secs: default_bridge_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub engineer: Option<String>,
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            engineer: None,
            shutdown_drain_secs: default_shutdown_drain_secs(),
            polling: PollingConfig::default(),
            notifications: NotificationConfig::default(),
            stability: StabilityConfig::default(),
            extraction: ExtractionConfig::default(),
            identity: IdentityConfig::default(),
            directory: DirectoryConfig::default(),
            source: SourceConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Rejects settings the pipeline cannot run with. Called once at startup;
    /// any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.polling.interval_ms == 0 {
            return Err(MonitorError::Configuration(
                "polling.interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.stability.max_attempts == 0 {
            return Err(MonitorError::Configuration(
                "stability.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.extraction.max_concurrent == 0 {
            return Err(MonitorError::Configuration(
                "extraction.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.extraction.timeout_secs == 0 {
            return Err(MonitorError::Configuration(
                "extraction.timeout_secs must be greater than zero".to_string(),
            ));
        }
        self.compiled_project_patterns()?;
        Ok(())
    }

    pub fn compiled_project_patterns(&self) -> Result<Vec<Regex>> {
        self.identity
            .project_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    MonitorError::Configuration(format!(
                        "invalid project pattern {:?}: {}",
                        pattern, err
                    ))
                })
            })
            .collect()
    }

    /// Name recorded on sessions and versions.
    pub fn engineer_name(&self) -> String {
        self.engineer
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| std::env::var("USERNAME").ok())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.storage.db_path {
            Some(path) => Ok(path.clone()),
            None => home_relative(DEFAULT_DB_RELATIVE_PATH),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.notifications.debounce_ms)
    }

    pub fn stability_delay(&self) -> Duration {
        Duration::from_millis(self.stability.delay_ms)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction.timeout_secs)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    home_relative(DEFAULT_CONFIG_RELATIVE_PATH)
}

pub fn load_config(path: Option<PathBuf>) -> Result<MonitorConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(MonitorConfig::default());
    }

    let content =
        fs_err::read_to_string(&config_path).map_err(|err| MonitorError::ConfigMalformed {
            path: config_path.clone(),
            details: err.to_string(),
        })?;
    let config = toml::from_str::<MonitorConfig>(&content).map_err(|err| {
        MonitorError::ConfigMalformed {
            path: config_path.clone(),
            details: err.to_string(),
        }
    })?;
    config.validate()?;
    Ok(config)
}

fn home_relative(relative: &str) -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MonitorError::Configuration("Home directory not found".to_string()))?;
    Ok(home.join(relative))
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_source_warning_after() -> u32 {
    10
}

fn default_debounce_ms() -> u64 {
    3_000
}

fn default_stability_attempts() -> u32 {
    5
}

fn default_stability_delay_ms() -> u64 {
    500
}

fn default_max_concurrent_extractions() -> usize {
    2
}

fn default_extraction_timeout_secs() -> u64 {
    120
}

fn default_directory_timeout_secs() -> u64 {
    10
}

fn default_bridge_timeout_secs() -> u64 {
    30
}

fn default_shutdown_drain_secs() -> u64 {
    30
}

fn default_project_patterns() -> Vec<String> {
    vec![
        r"^(P-\d{3,})".to_string(),
        r"^(\d{4,}-\d{2,})".to_string(),
        r"\[(\w+)\]".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config =
            load_config(Some(temp_dir.path().join("absent.toml"))).expect("default config");
        assert_eq!(config.polling.interval_ms, 3_000);
        assert_eq!(config.extraction.timeout_secs, 120);
        assert_eq!(
            config.identity.unknown_project,
            UnknownProjectPolicy::CreatePlaceholder
        );
    }

    #[test]
    fn parses_partial_file_with_defaults_for_the_rest() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
engineer = "jdoe"

[polling]
interval_ms = 1500

[identity]
project_patterns = ['^(PRJ\d+)_']
unknown_project = "log-only"
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("config");
        assert_eq!(config.engineer_name(), "jdoe");
        assert_eq!(config.polling.interval_ms, 1500);
        assert_eq!(config.polling.initial_delay_ms, 5_000);
        assert_eq!(config.identity.project_patterns, vec![r"^(PRJ\d+)_"]);
        assert_eq!(config.identity.unknown_project, UnknownProjectPolicy::LogOnly);
        assert_eq!(config.stability.max_attempts, 5);
    }

    #[test]
    fn invalid_regex_is_a_configuration_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[identity]\nproject_patterns = ['(unclosed']\n")
            .expect("write config");

        let err = load_config(Some(path)).expect_err("invalid pattern");
        assert!(matches!(err, MonitorError::Configuration(_)));
    }

    #[test]
    fn malformed_toml_reports_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[polling\ninterval_ms = 1").expect("write config");

        let err = load_config(Some(path.clone())).expect_err("malformed");
        match err {
            MonitorError::ConfigMalformed { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = MonitorConfig::default();
        config.polling.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
