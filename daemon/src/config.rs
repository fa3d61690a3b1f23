//! Configuration management (TOML)

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub history: HistoryConfig,
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub watch: Vec<WatchCriterion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub poll_interval_seconds: f64,
    pub sample_timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub max_snapshots: usize,
    pub window_seconds: u64,
    /// Verdicts kept in memory for clients; older ones live only in the db.
    #[serde(default = "default_max_verdicts")]
    pub max_verdicts: usize,
    /// Stored verdicts older than this are deleted from the database.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub crash_threshold: f64,
    pub normal_threshold: f64,
    /// Snapshots at the tail of the window used for trend signals.
    pub trend_samples: usize,
    /// Relative memory growth across the trend samples (1.0 = doubled).
    pub memory_growth_ratio: f64,
    pub cpu_spike_percent: f64,
    pub idle_cpu_percent: f64,
    pub idle_samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Name,
    Cmdline,
    Pid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCriterion {
    #[serde(rename = "match")]
    pub pattern: String,
    pub match_type: MatchType,
}

impl WatchCriterion {
    pub fn name(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            match_type: MatchType::Name,
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self {
            pattern: pid.to_string(),
            match_type: MatchType::Pid,
        }
    }

    /// `argv0` is the first command line argument, compared by basename.
    pub fn matches(&self, pid: u32, name: &str, command_line: &str) -> bool {
        match self.match_type {
            MatchType::Pid => self.pattern.parse::<u32>().map(|p| p == pid).unwrap_or(false),
            MatchType::Name => {
                let argv0 = command_line.split_whitespace().next().unwrap_or("");
                let base = argv0.rsplit('/').next().unwrap_or(argv0);
                name == self.pattern || base == self.pattern
            }
            MatchType::Cmdline => command_line.contains(&self.pattern),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_verdicts() -> usize {
    1000
}

fn default_retention_days() -> u32 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: GeneralConfig {
                poll_interval_seconds: 1.0,
                sample_timeout_seconds: 0.5,
                notifications: true,
            },
            history: HistoryConfig {
                max_snapshots: 60,
                window_seconds: 60,
                max_verdicts: default_max_verdicts(),
                retention_days: default_retention_days(),
            },
            classifier: ClassifierConfig::default(),
            watch: vec![],
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            crash_threshold: 0.6,
            normal_threshold: 0.4,
            trend_samples: 3,
            memory_growth_ratio: 1.0,
            cpu_spike_percent: 85.0,
            idle_cpu_percent: 5.0,
            idle_samples: 5,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// `$CRASHSENSE_CONFIG`, else the per-user config dir.
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("CRASHSENSE_CONFIG") {
            return PathBuf::from(path);
        }
        directories::ProjectDirs::from("", "", "crashsense")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.general.poll_interval_seconds)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.general.sample_timeout_seconds)
    }

    /// Reject settings the monitoring loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let general = &self.general;
        if !(general.poll_interval_seconds.is_finite() && general.poll_interval_seconds > 0.0) {
            return Err(invalid("general.poll_interval_seconds must be positive"));
        }
        if !(general.sample_timeout_seconds.is_finite() && general.sample_timeout_seconds > 0.0) {
            return Err(invalid("general.sample_timeout_seconds must be positive"));
        }
        if general.sample_timeout_seconds >= general.poll_interval_seconds {
            return Err(invalid(
                "general.sample_timeout_seconds must be shorter than the poll interval",
            ));
        }

        let history = &self.history;
        if history.max_snapshots < 2 {
            return Err(invalid("history.max_snapshots must be at least 2"));
        }
        let span = history.max_snapshots as f64 * general.poll_interval_seconds;
        if span < history.window_seconds as f64 {
            return Err(invalid(format!(
                "history.max_snapshots ({}) x poll interval ({}s) cannot cover window_seconds ({})",
                history.max_snapshots, general.poll_interval_seconds, history.window_seconds
            )));
        }

        let c = &self.classifier;
        for (name, value) in [
            ("crash_threshold", c.crash_threshold),
            ("normal_threshold", c.normal_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("classifier.{} must be within [0, 1]", name)));
            }
        }
        if c.normal_threshold > 0.5 || c.crash_threshold < 0.5 {
            return Err(invalid(
                "classifier thresholds must satisfy normal_threshold <= 0.5 <= crash_threshold",
            ));
        }
        if c.trend_samples < 2 {
            return Err(invalid("classifier.trend_samples must be at least 2"));
        }
        if c.idle_samples < 2 {
            return Err(invalid("classifier.idle_samples must be at least 2"));
        }
        if c.memory_growth_ratio <= 0.0 {
            return Err(invalid("classifier.memory_growth_ratio must be positive"));
        }

        for criterion in &self.watch {
            if criterion.pattern.trim().is_empty() {
                return Err(invalid("watch entries need a non-empty match"));
            }
            if criterion.match_type == MatchType::Pid && criterion.pattern.parse::<u32>().is_err() {
                return Err(invalid(format!("'{}' is not a pid", criterion.pattern)));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
