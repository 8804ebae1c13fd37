//! Application directory layout
//!
//! Everything lives under a single per-user root so the tool behaves the same
//! no matter which directory it is launched from.

use super::error::ConfigError;
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = "SanitySuite";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const WORKFLOWS_DIR_NAME: &str = "workflows";
pub const LOGS_DIR_NAME: &str = "logs";
pub const BACKUPS_DIR_NAME: &str = "backups";
pub const HISTORY_DB_NAME: &str = "history.db";

/// Environment variable that relocates the application root
pub const HOME_ENV: &str = "SANITY_HOME";

/// Root application data directory (`%APPDATA%\SanitySuite` on Windows)
pub fn app_root() -> Result<PathBuf, ConfigError> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(app_root()?.join(CONFIG_FILE_NAME))
}

pub fn logs_dir() -> Result<PathBuf, ConfigError> {
    Ok(app_root()?.join(LOGS_DIR_NAME))
}

pub fn workflows_dir() -> Result<PathBuf, ConfigError> {
    Ok(app_root()?.join(WORKFLOWS_DIR_NAME))
}

pub fn backups_dir() -> Result<PathBuf, ConfigError> {
    Ok(app_root()?.join(BACKUPS_DIR_NAME))
}

pub fn history_db_path() -> Result<PathBuf, ConfigError> {
    Ok(app_root()?.join(HISTORY_DB_NAME))
}

/// Create the application directory structure if it is missing
pub fn ensure_app_dirs() -> Result<PathBuf, ConfigError> {
    let root = app_root()?;
    ensure_dirs_under(&root)?;
    Ok(root)
}

fn ensure_dirs_under(root: &Path) -> Result<(), ConfigError> {
    for sub in [LOGS_DIR_NAME, WORKFLOWS_DIR_NAME, BACKUPS_DIR_NAME] {
        let dir = root.join(sub);
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::CreateDir {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Expand `~` and environment variables in a user-supplied path
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(raw),
    }
}
