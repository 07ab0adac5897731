//! Configuration management for logmon
//!
//! Handles loading and validation of logmon.toml configuration files.
//!
//! # Schema Overview
//!
//! The configuration is structured into sections:
//! - `general`: Log level, log format, optional log file
//! - `monitor`: History capacity, warning threshold, cache and buffer sizes
//! - `rules`: The `[[rules]]` array; list order is match priority
//!
//! # Forward Compatibility
//!
//! All sections use `#[serde(default)]` to allow missing fields.
//! Unknown fields are ignored to support forward compatibility.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::aggregator::{DEFAULT_HISTORY_CAPACITY, DEFAULT_WARNING_THRESHOLD};
use crate::error::ConfigError;
use crate::monitor::{DEFAULT_CHANNEL_BUFFER, RuntimeConfig};
use crate::patterns::DEFAULT_REGEX_CACHE_CAPACITY;
use crate::rules::{Rule, validate_rules};
use crate::tailer::DEFAULT_MAX_READ_BYTES;

const CONFIG_FILE_NAME: &str = "logmon.toml";

// =============================================================================
// Main Config
// =============================================================================

/// Main configuration structure for logmon
///
/// All sections are optional with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// General settings (logging)
    pub general: GeneralConfig,

    /// Monitor tuning
    pub monitor: MonitorConfig,

    /// Rule definitions, in registration (priority) order
    pub rules: Vec<Rule>,
}

// =============================================================================
// General Config
// =============================================================================

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format (default for interactive use)
    #[default]
    Pretty,
    /// Machine-parseable JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ParseError(format!(
                "invalid log format: {other} (expected 'pretty' or 'json')"
            ))),
        }
    }
}

/// General configuration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Log format: pretty (human-readable) or json (machine-parseable)
    pub log_format: LogFormat,

    /// Optional log file path (supports ~ expansion)
    /// When set, logs are appended to this file in addition to stderr
    pub log_file: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

// =============================================================================
// Monitor Config
// =============================================================================

/// Monitor tuning knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Match events kept in memory
    pub history_capacity: usize,

    /// Consecutive matches of one rule that raise a warning
    pub warning_threshold: u32,

    /// Compiled regexes kept in the LRU cache
    pub regex_cache_capacity: usize,

    /// Matches queued between watcher tasks and the monitor
    pub channel_buffer: usize,

    /// Largest single read from a log file, in bytes
    pub max_read_bytes: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            regex_cache_capacity: DEFAULT_REGEX_CACHE_CAPACITY,
            channel_buffer: DEFAULT_CHANNEL_BUFFER,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            history_capacity: self.history_capacity,
            warning_threshold: self.warning_threshold,
            regex_cache_capacity: self.regex_cache_capacity,
            channel_buffer: self.channel_buffer,
            max_read_bytes: self.max_read_bytes,
        }
    }
}

// =============================================================================
// Config Loading
// =============================================================================

/// CLI overrides applied after env overrides
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Override log level
    pub log_level: Option<String>,
    /// Override log format (pretty or json)
    pub log_format: Option<LogFormat>,
    /// Override log file path
    pub log_file: Option<String>,
    /// Override history capacity
    pub history_capacity: Option<usize>,
    /// Override warning threshold
    pub warning_threshold: Option<u32>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(ref log_level) = self.log_level {
            config.general.log_level.clone_from(log_level);
        }
        if let Some(log_format) = self.log_format {
            config.general.log_format = log_format;
        }
        if let Some(ref log_file) = self.log_file {
            config.general.log_file = Some(log_file.clone());
        }
        if let Some(capacity) = self.history_capacity {
            config.monitor.history_capacity = capacity;
        }
        if let Some(threshold) = self.warning_threshold {
            config.monitor.warning_threshold = threshold;
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct EnvOverrides {
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    log_file: Option<String>,
    history_capacity: Option<usize>,
    warning_threshold: Option<u32>,
}

impl EnvOverrides {
    fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let mut overrides = Self::default();

        if let Some(value) = lookup("LOGMON_LOG_LEVEL") {
            overrides.log_level = Some(value);
        }
        if let Some(value) = lookup("LOGMON_LOG_FORMAT") {
            overrides.log_format = Some(value.parse::<LogFormat>().map_err(crate::Error::Config)?);
        }
        if let Some(value) = lookup("LOGMON_LOG_FILE") {
            overrides.log_file = Some(value);
        }
        if let Some(value) = lookup("LOGMON_HISTORY_CAPACITY") {
            overrides.history_capacity = Some(parse_env_number("LOGMON_HISTORY_CAPACITY", &value)?);
        }
        if let Some(value) = lookup("LOGMON_WARNING_THRESHOLD") {
            overrides.warning_threshold =
                Some(parse_env_number("LOGMON_WARNING_THRESHOLD", &value)?);
        }

        Ok(overrides)
    }

    fn apply(self, config: &mut Config) {
        if let Some(log_level) = self.log_level {
            config.general.log_level = log_level;
        }
        if let Some(log_format) = self.log_format {
            config.general.log_format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.general.log_file = Some(log_file);
        }
        if let Some(capacity) = self.history_capacity {
            config.monitor.history_capacity = capacity;
        }
        if let Some(threshold) = self.warning_threshold {
            config.monitor.warning_threshold = threshold;
        }
    }
}

/// Resolve the config path that would be loaded (if any).
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let cwd_config = Path::new(CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config.to_path_buf());
    }

    dirs_config_path()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .filter(|path| path.exists())
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./logmon.toml (current directory)
    /// 2. $XDG_CONFIG_HOME/logmon/logmon.toml or ~/.config/logmon/logmon.toml
    /// 3. Default values
    pub fn load() -> crate::Result<Self> {
        match resolve_config_path(None) {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Load configuration with overrides and validation
    ///
    /// Resolution order: defaults -> config file -> env -> CLI overrides.
    /// With `strict`, an explicit path that does not exist is an error.
    pub fn load_with_overrides(
        config_path: Option<&Path>,
        strict: bool,
        overrides: &ConfigOverrides,
    ) -> crate::Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                if path.exists() {
                    Self::load_from(path)?
                } else if strict {
                    return Err(ConfigError::FileNotFound(path.display().to_string()).into());
                } else {
                    Self::default()
                }
            }
            None => Self::load()?,
        };

        EnvOverrides::from_env()?.apply(&mut config);
        overrides.apply(&mut config);
        config.normalize_paths();
        config.validate()?;

        Ok(config)
    }

    /// Normalize path fields by expanding tildes
    pub fn normalize_paths(&mut self) {
        if let Some(log_file) = self.general.log_file.take() {
            self.general.log_file = Some(path_to_string(&expand_tilde(&log_file)));
        }
        for rule in &mut self.rules {
            if let Some(raw) = rule.path.to_str() {
                rule.path = expand_tilde(raw);
            }
        }
    }

    /// Validate semantic constraints
    pub fn validate(&self) -> crate::Result<()> {
        let positive = [
            ("monitor.history_capacity", self.monitor.history_capacity),
            ("monitor.regex_cache_capacity", self.monitor.regex_cache_capacity),
            ("monitor.channel_buffer", self.monitor.channel_buffer),
            ("monitor.max_read_bytes", self.monitor.max_read_bytes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{field} must be >= 1")).into());
            }
        }

        if self.monitor.warning_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.warning_threshold must be >= 1".to_string(),
            )
            .into());
        }

        if crate::logging::LogLevel::parse(&self.general.log_level).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "general.log_level '{}' is not one of trace, debug, info, warn, error",
                self.general.log_level
            ))
            .into());
        }

        validate_rules(&self.rules).map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }
}

/// Get the config directory path (XDG on Linux, Library on macOS)
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support").join("logmon"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .map(|p| p.join("logmon"))
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    if let Some(suffix) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(suffix);
        }
    }
    PathBuf::from(path)
}

fn parse_env_number<T: std::str::FromStr>(key: &str, value: &str) -> crate::Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        ConfigError::ValidationError(format!(
            "Invalid numeric value '{value}' for environment override {key}"
        ))
        .into()
    })
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.monitor.history_capacity, 100);
        assert_eq!(config.monitor.warning_threshold, 50);
        assert_eq!(config.monitor.regex_cache_capacity, 100);
        assert!(config.rules.is_empty());
        config.validate().expect("defaults validate");
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = Config::from_toml("").expect("Failed to parse empty TOML");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_toml_uses_defaults_for_missing() {
        let toml = r#"
[general]
log_level = "debug"

[monitor]
warning_threshold = 10
"#;
        let config = Config::from_toml(toml).expect("Failed to parse");

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.monitor.warning_threshold, 10);
        assert_eq!(config.monitor.history_capacity, 100);
        assert_eq!(config.general.log_format, LogFormat::Pretty);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let toml = r#"
[general]
log_level = "warn"
future_option = true

[telemetry]
enabled = true
"#;
        let config = Config::from_toml(toml).expect("unknown fields tolerated");
        assert_eq!(config.general.log_level, "warn");
    }

    #[test]
    fn rules_parse_in_order_with_appearance() {
        let toml = r#"
[[rules]]
id = "nginx-5xx"
name = "nginx 5xx"
regex = 'HTTP/1\.1" (5\d\d)'
path = "/var/log/nginx/access.log"
color = "red"

[[rules]]
id = "oom"
name = "OOM killer"
regex = "Out of memory"
path = "/var/log/kern.log"
enabled = false
"#;
        let config = Config::from_toml(toml).expect("Failed to parse");
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].id.as_str(), "nginx-5xx");
        assert_eq!(config.rules[0].appearance.color.as_deref(), Some("red"));
        assert!(config.rules[0].enabled);
        assert!(!config.rules[1].enabled);
        config.validate().expect("valid rules");
    }

    #[test]
    fn config_with_rules_roundtrips_through_toml() {
        let mut config = Config::default();
        config.rules.push(Rule::new("a", "Rule A", "ERROR: (.*)", "/var/log/a.log"));
        config.general.log_format = LogFormat::Json;
        let text = config.to_toml().expect("serialize");
        assert!(text.contains("[[rules]]"));
        assert!(text.contains("[monitor]"));
        let parsed = Config::from_toml(&text).expect("parse");
        assert_eq!(parsed, config);
    }

    #[test]
    fn invalid_toml_is_parse_error() {
        let err = Config::from_toml("[general\nlog_level = 1").unwrap_err();
        assert!(matches!(err, crate::Error::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut config = Config::default();
        config.monitor.history_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitor.history_capacity"));

        let mut config = Config::default();
        config.monitor.warning_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.general.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_duplicate_rule_ids() {
        let mut config = Config::default();
        config.rules = vec![
            Rule::new("dup", "One", "a", "/x"),
            Rule::new("dup", "Two", "b", "/y"),
        ];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, crate::Error::Config(ConfigError::ValidationError(_))));
    }

    #[test]
    fn invalid_regex_is_not_a_config_error() {
        let mut config = Config::default();
        config.rules = vec![Rule::new("broken", "Broken", "(", "/x")];
        config.validate().expect("regex syntax is checked at match time");
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn env_overrides_parse_and_apply() {
        let env: HashMap<&str, &str> = [
            ("LOGMON_LOG_LEVEL", "debug"),
            ("LOGMON_LOG_FORMAT", "json"),
            ("LOGMON_HISTORY_CAPACITY", "25"),
            ("LOGMON_WARNING_THRESHOLD", " 7 "),
        ]
        .into_iter()
        .collect();
        let overrides =
            EnvOverrides::from_lookup(|key| env.get(key).map(ToString::to_string)).unwrap();
        let mut config = Config::default();
        overrides.apply(&mut config);
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.monitor.history_capacity, 25);
        assert_eq!(config.monitor.warning_threshold, 7);
    }

    #[test]
    fn env_overrides_reject_bad_values() {
        let bad_number = EnvOverrides::from_lookup(|key| {
            (key == "LOGMON_HISTORY_CAPACITY").then(|| "lots".to_string())
        });
        assert!(bad_number.is_err());

        let bad_format =
            EnvOverrides::from_lookup(|key| (key == "LOGMON_LOG_FORMAT").then(|| "xml".to_string()));
        assert!(bad_format.is_err());
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let mut config = Config::from_toml("[monitor]\nhistory_capacity = 10\n").unwrap();
        let overrides = ConfigOverrides {
            history_capacity: Some(3),
            log_level: Some("trace".to_string()),
            ..ConfigOverrides::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.monitor.history_capacity, 3);
        assert_eq!(config.general.log_level, "trace");
    }

    #[test]
    fn runtime_config_mirrors_monitor_section() {
        let monitor = MonitorConfig {
            history_capacity: 5,
            warning_threshold: 6,
            regex_cache_capacity: 7,
            channel_buffer: 8,
            max_read_bytes: 9,
        };
        let runtime = monitor.runtime_config();
        assert_eq!(runtime.history_capacity, 5);
        assert_eq!(runtime.warning_threshold, 6);
        assert_eq!(runtime.regex_cache_capacity, 7);
        assert_eq!(runtime.channel_buffer, 8);
        assert_eq!(runtime.max_read_bytes, 9);
    }

    #[test]
    fn tilde_expansion_applies_to_rule_paths_and_log_file() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let mut config = Config::default();
        config.general.log_file = Some("~/logs/logmon.log".to_string());
        config.rules = vec![Rule::new("a", "A", "x", "~/app.log")];
        config.normalize_paths();
        assert_eq!(
            config.general.log_file.as_deref(),
            Some(path_to_string(&home.join("logs/logmon.log")).as_str())
        );
        assert_eq!(config.rules[0].path, home.join("app.log"));
    }

    #[test]
    fn load_from_file_and_strict_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[[rules]]\nid = \"a\"\nname = \"A\"\nregex = \"x\"\npath = \"/tmp/a.log\"\n",
        )
        .unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.rules.len(), 1);

        let missing = dir.path().join("missing.toml");
        let err = Config::load_with_overrides(Some(&missing), true, &ConfigOverrides::default())
            .unwrap_err();
        assert!(matches!(err, crate::Error::Config(ConfigError::FileNotFound(_))));
        assert_eq!(resolve_config_path(Some(&missing)), Some(missing));
    }
}
