//! Application settings with layered loading
//!
//! Load order (later overrides earlier):
//! 1. Built-in defaults
//! 2. `<app root>/config.toml`
//! 3. An explicit `--config` file

use super::error::ConfigError;
use super::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub ui: UiSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub ports: PortsSettings,

    #[serde(default)]
    pub exec: ExecSettings,

    #[serde(default)]
    pub hosts: HostsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UiSettings {
    pub theme: String,
    pub last_active_tab: String,
    /// Port pre-filled for `ports scan`
    pub default_port: u16,
    pub default_host: String,
}

impl Default for UiSettings {
    fn default() -> Self {
        Self {
            theme: "dark".into(),
            last_active_tab: "dashboard".into(),
            default_port: 3010,
            default_host: "localhost".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkSettings {
    /// URL used by `network head` when none is given
    pub probe_host: String,
    /// Host used by `network ping` when none is given
    pub ping_target: String,
    pub ping_count: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_host: "https://www.microsoft.com".into(),
            ping_target: "8.8.8.8".into(),
            ping_count: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsSettings {
    pub suggest_start: u16,
    pub suggest_end: u16,
}

impl Default for PortsSettings {
    fn default() -> Self {
        Self {
            suggest_start: 3000,
            suggest_end: 3100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecSettings {
    /// Timeout in seconds applied to commands that don't set their own
    pub default_timeout: f64,
    /// Max concurrent command sequences
    pub max_workers: usize,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            default_timeout: crate::exec::DEFAULT_TIMEOUT_SECS,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostsSettings {
    /// Hosts file location; platform default when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Copy the hosts file into the backups directory before each write
    pub backup: bool,
}

impl Default for HostsSettings {
    fn default() -> Self {
        Self {
            path: None,
            backup: true,
        }
    }
}

impl HostsSettings {
    #[cfg(windows)]
    pub const DEFAULT_PATH: &'static str = r"C:\Windows\System32\drivers\etc\hosts";
    #[cfg(not(windows))]
    pub const DEFAULT_PATH: &'static str = "/etc/hosts";

    pub fn resolved_path(&self) -> PathBuf {
        match self.path.as_deref() {
            Some(raw) if !raw.trim().is_empty() => paths::expand_path(raw),
            _ => PathBuf::from(Self::DEFAULT_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    /// Number of daily log files kept
    pub retention_days: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            retention_days: 7,
        }
    }
}

/// Keys accepted by [`AppConfig::set`]
pub const SETTABLE_KEYS: &[&str] = &[
    "ui.theme",
    "ui.last_active_tab",
    "ui.default_port",
    "ui.default_host",
    "network.probe_host",
    "network.ping_target",
    "network.ping_count",
    "ports.suggest_start",
    "ports.suggest_end",
    "exec.default_timeout",
    "exec.max_workers",
    "hosts.path",
    "hosts.backup",
    "logging.level",
    "logging.retention_days",
];

impl AppConfig {
    /// Load configuration from the standard hierarchy
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        let user_path = paths::config_path()?;
        if user_path.exists() {
            deep_merge(&mut merged, read_table(&user_path)?);
        }

        if let Some(path) = explicit {
            deep_merge(&mut merged, read_table(path)?);
        }

        let config: Self =
            toml::Value::Table(merged)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: explicit.map(Path::to_path_buf).unwrap_or(user_path),
                    message: e.to_string(),
                })?;
        config.check()?;

        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from a single file (no layering)
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.check()?;
        Ok(config)
    }

    /// Persist to `<app root>/config.toml`
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        paths::ensure_app_dirs()?;
        let path = paths::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Update a single dotted setting such as `ui.default_port`
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "ui.theme" => self.ui.theme = value.to_string(),
            "ui.last_active_tab" => self.ui.last_active_tab = value.to_string(),
            "ui.default_port" => self.ui.default_port = parse_value(key, value)?,
            "ui.default_host" => self.ui.default_host = value.to_string(),
            "network.probe_host" => self.network.probe_host = value.to_string(),
            "network.ping_target" => self.network.ping_target = value.to_string(),
            "network.ping_count" => self.network.ping_count = parse_value(key, value)?,
            "ports.suggest_start" => self.ports.suggest_start = parse_value(key, value)?,
            "ports.suggest_end" => self.ports.suggest_end = parse_value(key, value)?,
            "exec.default_timeout" => self.exec.default_timeout = parse_value(key, value)?,
            "exec.max_workers" => self.exec.max_workers = parse_value(key, value)?,
            "hosts.path" => {
                self.hosts.path = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "hosts.backup" => self.hosts.backup = parse_value(key, value)?,
            "logging.level" => self.logging.level = value.to_string(),
            "logging.retention_days" => self.logging.retention_days = parse_value(key, value)?,
            _ => {
                return Err(ConfigError::UnknownKey {
                    key: key.to_string(),
                });
            }
        }
        self.check()
    }

    /// Reject values that parse but make no sense
    fn check(&self) -> Result<(), ConfigError> {
        if self.ports.suggest_start > self.ports.suggest_end {
            return Err(ConfigError::invalid_value(
                "ports.suggest_start",
                self.ports.suggest_start.to_string(),
                format!("must not exceed ports.suggest_end ({})", self.ports.suggest_end),
            ));
        }
        if !crate::exec::is_valid_timeout(self.exec.default_timeout) {
            return Err(ConfigError::invalid_value(
                "exec.default_timeout",
                self.exec.default_timeout.to_string(),
                format!(
                    "must be a positive number of seconds, at most {}",
                    crate::exec::MAX_TIMEOUT_SECS
                ),
            ));
        }
        if self.exec.max_workers == 0 {
            return Err(ConfigError::invalid_value(
                "exec.max_workers",
                "0",
                "at least one worker is required",
            ));
        }
        if self.network.ping_count == 0 {
            return Err(ConfigError::invalid_value(
                "network.ping_count",
                "0",
                "at least one echo request is required",
            ));
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid_value(key, value, e.to_string()))
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    contents.parse::<toml::Table>().map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge `other` into `base`, recursing into nested tables (other wins)
fn deep_merge(base: &mut toml::Table, other: toml::Table) {
    for (key, value) in other {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
