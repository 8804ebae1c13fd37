//! Hosts file parsing and editing
//!
//! Edits operate on the file text so unrelated lines, comments and line
//! endings survive untouched.

use crate::config::{AppConfig, paths};
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HostsError {
    #[error("'{0}' is not a valid IP address")]
    InvalidIp(String),

    #[error("'{0}' is not a valid host name")]
    InvalidHostname(String),

    #[error("an entry for '{0}' already exists")]
    AlreadyExists(String),

    #[error("no entry for '{0}'")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source} (editing the hosts file usually needs administrator rights)")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to back up {path}: {source}")]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One mapping line of the hosts file
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: String,
    pub hostnames: Vec<String>,
    pub comment: Option<String>,
    /// False when the line is commented out
    pub enabled: bool,
    /// 1-based line number
    pub line_number: usize,
}

impl HostEntry {
    pub fn has_hostname(&self, hostname: &str) -> bool {
        self.hostnames
            .iter()
            .any(|h| h.eq_ignore_ascii_case(hostname))
    }
}

/// `ip host [host...] [# comment]` without any leading `#`
fn parse_mapping(content: &str) -> Option<(String, Vec<String>, Option<String>)> {
    let (mapping, comment) = match content.split_once('#') {
        Some((mapping, comment)) => (mapping, Some(comment.trim().to_string())),
        None => (content, None),
    };
    let mut tokens = mapping.split_whitespace();
    let ip = tokens.next()?;
    ip.parse::<IpAddr>().ok()?;
    let hostnames: Vec<String> = tokens.map(str::to_string).collect();
    if hostnames.is_empty() {
        return None;
    }
    Some((
        ip.to_string(),
        hostnames,
        comment.filter(|c| !c.is_empty()),
    ))
}

const BOM: char = '\u{feff}';

/// Split a leading byte order mark off `text`
fn split_bom(text: &str) -> (&str, &str) {
    match text.strip_prefix(BOM) {
        Some(body) => (&text[..BOM.len_utf8()], body),
        None => ("", text),
    }
}

fn parse_line(line: &str, line_number: usize) -> Option<HostEntry> {
    let trimmed = line.trim_start_matches(BOM).trim();
    if trimmed.is_empty() {
        return None;
    }
    let (content, enabled) = match trimmed.strip_prefix('#') {
        Some(rest) => (rest.trim_start_matches('#').trim(), false),
        None => (trimmed, true),
    };
    let (ip, hostnames, comment) = parse_mapping(content)?;
    Some(HostEntry {
        ip,
        hostnames,
        comment,
        enabled,
        line_number,
    })
}

/// Parse every mapping line; `# <ip> <name>` lines are disabled entries
pub fn parse_hosts(text: &str) -> Vec<HostEntry> {
    text.lines()
        .enumerate()
        .filter_map(|(idx, line)| parse_line(line, idx + 1))
        .collect()
}

fn line_ending(text: &str) -> &'static str {
    if text.contains("\r\n") { "\r\n" } else { "\n" }
}

fn check_hostname(hostname: &str) -> Result<(), HostsError> {
    if hostname.is_empty()
        || hostname.len() > 253
        || !hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return Err(HostsError::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}

/// Append `ip<TAB>hostname[<TAB># comment]`
pub fn add_entry(
    text: &str,
    ip: &str,
    hostname: &str,
    comment: Option<&str>,
) -> Result<String, HostsError> {
    let ip = ip.trim();
    let hostname = hostname.trim();
    ip.parse::<IpAddr>()
        .map_err(|_| HostsError::InvalidIp(ip.to_string()))?;
    check_hostname(hostname)?;
    if parse_hosts(text).iter().any(|e| e.has_hostname(hostname)) {
        return Err(HostsError::AlreadyExists(hostname.to_string()));
    }

    let eol = line_ending(text);
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str(eol);
    }
    out.push_str(ip);
    out.push('\t');
    out.push_str(hostname);
    if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
        out.push_str("\t# ");
        out.push_str(comment);
    }
    out.push_str(eol);
    Ok(out)
}

fn line_has_hostname(line: &str, hostname: &str) -> bool {
    parse_line(line, 0).is_some_and(|e| e.has_hostname(hostname))
}

/// Remove every line mapping `hostname`
pub fn remove_entry(text: &str, hostname: &str) -> Result<String, HostsError> {
    let hostname = hostname.trim();
    let (bom, body) = split_bom(text);
    let mut removed = false;
    let out: String = std::iter::once(bom)
        .chain(body.split_inclusive('\n').filter(|line| {
            let matches = line_has_hostname(line, hostname);
            removed |= matches;
            !matches
        }))
        .collect();

    if removed {
        Ok(out)
    } else {
        Err(HostsError::NotFound(hostname.to_string()))
    }
}

fn toggle_line(line: &str, enable: bool) -> String {
    let (body, eol) = match line.strip_suffix("\r\n") {
        Some(body) => (body, "\r\n"),
        None => match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        },
    };
    if enable {
        let uncommented = body.trim_start().trim_start_matches('#').trim_start();
        format!("{uncommented}{eol}")
    } else {
        format!("# {body}{eol}")
    }
}

/// Flip every line mapping `hostname`; returns the new text and whether the
/// entry is now enabled
pub fn toggle_entry(text: &str, hostname: &str) -> Result<(String, bool), HostsError> {
    let hostname = hostname.trim();
    let first = parse_hosts(text)
        .into_iter()
        .find(|e| e.has_hostname(hostname))
        .ok_or_else(|| HostsError::NotFound(hostname.to_string()))?;
    let enable = !first.enabled;

    let (bom, body) = split_bom(text);
    let mut out = bom.to_string();
    for line in body.split_inclusive('\n') {
        if line_has_hostname(line, hostname) {
            out.push_str(&toggle_line(line, enable));
        } else {
            out.push_str(line);
        }
    }
    Ok((out, enable))
}

/// The hosts file on disk
#[derive(Debug, Clone)]
pub struct HostsFile {
    pub path: PathBuf,
    /// Where backups go; `None` disables them
    pub backup_dir: Option<PathBuf>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: None,
        }
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let file = Self::new(config.hosts.resolved_path());
        match (config.hosts.backup, paths::backups_dir()) {
            (true, Ok(dir)) => file.with_backup_dir(dir),
            _ => file,
        }
    }

    /// File contents; bytes that are not UTF-8 are replaced rather than rejected
    pub fn read(&self) -> Result<String, HostsError> {
        let bytes = std::fs::read(&self.path).map_err(|source| HostsError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn entries(&self) -> Result<Vec<HostEntry>, HostsError> {
        Ok(parse_hosts(&self.read()?))
    }

    /// Write new contents, backing up the current file first when enabled.
    /// Returns the backup path.
    pub fn write(&self, contents: &str) -> Result<Option<PathBuf>, HostsError> {
        let backup = match &self.backup_dir {
            Some(dir) if self.path.exists() => Some(self.backup_to(dir)?),
            _ => None,
        };
        std::fs::write(&self.path, contents).map_err(|source| HostsError::Write {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), backup = ?backup, "hosts file written");
        Ok(backup)
    }

    fn backup_to(&self, dir: &Path) -> Result<PathBuf, HostsError> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%3f");
        let target = dir.join(format!("hosts-{stamp}.bak"));
        std::fs::create_dir_all(dir)
            .and_then(|_| std::fs::copy(&self.path, &target))
            .map_err(|source| HostsError::Backup {
                path: target.clone(),
                source,
            })?;
        Ok(target)
    }

    /// Whether the current process may modify the file
    pub fn is_writable(&self) -> bool {
        std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .is_ok()
    }
}
