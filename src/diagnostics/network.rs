//! Adapter, ping and HTTP reachability checks

use super::{DiagnosticError, run_checked};
use crate::exec::{CommandResult, CommandRunner, CommandSpec};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct NetworkAdapter {
    pub name: String,
    pub description: String,
    pub addresses: Vec<String>,
    pub is_up: bool,
}

static KEY_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+(\S[^:]*?)[\s.]*:\s?(.*)$").expect("ipconfig key/value regex")
});

static ADDRESS_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((Preferred|Deprecated|Tentative|Duplicate)\)$").expect("suffix regex"));

/// Parse `ipconfig /all` into adapters
pub fn parse_ipconfig(text: &str) -> Vec<NetworkAdapter> {
    let mut adapters: Vec<NetworkAdapter> = Vec::new();
    let mut current: Option<NetworkAdapter> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let indented = line.starts_with(char::is_whitespace);
        if !indented {
            if let Some(adapter) = current.take() {
                adapters.push(adapter);
            }
            let header = line.trim().trim_end_matches(':');
            if let Some((_, name)) = header.split_once(" adapter ") {
                current = Some(NetworkAdapter {
                    name: name.trim().to_string(),
                    is_up: true,
                    ..Default::default()
                });
            }
            continue;
        }

        let Some(adapter) = current.as_mut() else {
            continue;
        };
        let Some(caps) = KEY_VALUE.captures(line) else {
            continue;
        };
        let key = caps[1].trim();
        let value = caps[2].trim();

        if key == "Description" {
            adapter.description = value.to_string();
        } else if key == "Media State" {
            if value.eq_ignore_ascii_case("Media disconnected") {
                adapter.is_up = false;
            }
        } else if key.ends_with("IPv4 Address") || key.ends_with("IPv6 Address") {
            let address = ADDRESS_SUFFIX.replace(value, "").trim().to_string();
            if !address.is_empty() {
                adapter.addresses.push(address);
            }
        }
    }

    if let Some(adapter) = current {
        adapters.push(adapter);
    }
    adapters
}

/// `ping` flag for the number of echo requests
pub const PING_COUNT_FLAG: &str = if cfg!(windows) { "-n" } else { "-c" };

/// Adapters reported by `ipconfig /all`
pub async fn list_adapters(runner: &dyn CommandRunner) -> Result<Vec<NetworkAdapter>, DiagnosticError> {
    let output = run_checked(runner, &CommandSpec::process(["ipconfig", "/all"]).with_timeout(20.0)).await?;
    Ok(parse_ipconfig(&output.stdout))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PingSummary {
    pub sent: u32,
    pub received: u32,
    pub loss_percent: f64,
    pub average_ms: Option<f64>,
}

impl PingSummary {
    pub fn reachable(&self) -> bool {
        self.received > 0
    }
}

static WIN_PACKETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Sent = (\d+), Received = (\d+), Lost = \d+ \((\d+)% loss\)").expect("ping regex")
});
static WIN_AVERAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Average = (\d+)ms").expect("ping average regex"));
static UNIX_PACKETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received.*?([\d.]+)% packet loss")
        .expect("ping regex")
});
static UNIX_AVERAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"= [\d.]+/([\d.]+)/[\d.]+(?:/[\d.]+)? ms").expect("ping average regex")
});

/// Parse the statistics block of Windows or Unix `ping` output
pub fn parse_ping_summary(text: &str) -> Option<PingSummary> {
    if let Some(caps) = WIN_PACKETS.captures(text) {
        return Some(PingSummary {
            sent: caps[1].parse().ok()?,
            received: caps[2].parse().ok()?,
            loss_percent: caps[3].parse().ok()?,
            average_ms: WIN_AVERAGE
                .captures(text)
                .and_then(|c| c[1].parse().ok()),
        });
    }
    if let Some(caps) = UNIX_PACKETS.captures(text) {
        return Some(PingSummary {
            sent: caps[1].parse().ok()?,
            received: caps[2].parse().ok()?,
            loss_percent: caps[3].parse().ok()?,
            average_ms: UNIX_AVERAGE
                .captures(text)
                .and_then(|c| c[1].parse().ok()),
        });
    }
    None
}

/// Ping `host`; an unreachable host is a result, not an error
pub async fn ping_host(
    runner: &dyn CommandRunner,
    host: &str,
    count: u32,
) -> Result<(CommandResult, Option<PingSummary>), DiagnosticError> {
    let host = host.trim();
    if host.is_empty() || host.starts_with('-') {
        return Err(DiagnosticError::InvalidInput(format!(
            "invalid ping target '{host}'"
        )));
    }
    let count = count.clamp(1, 100).to_string();
    let spec = CommandSpec::process(["ping", PING_COUNT_FLAG, count.as_str(), host]).with_timeout(60.0);
    let result = runner.run(&spec).await?;
    let summary = parse_ping_summary(&result.stdout);
    debug!(host, exit_code = result.exit_code, ?summary, "ping finished");
    Ok((result, summary))
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeadResult {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub elapsed_ms: u64,
}

impl HeadResult {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Prefix `https://` when no scheme is given
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// Send a HEAD request, following redirects
pub async fn http_head(url: &str, timeout: Duration) -> Result<HeadResult, DiagnosticError> {
    let url = normalize_url(url);
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("sanity-suite/", env!("CARGO_PKG_VERSION")));
    // A proxy cannot reach our loopback services
    if is_loopback_url(&url) {
        builder = builder.no_proxy();
    }
    let client = builder
        .build()
        .map_err(|source| DiagnosticError::Http {
            url: url.clone(),
            source,
        })?;

    let start = Instant::now();
    let response = client
        .head(&url)
        .send()
        .await
        .map_err(|source| DiagnosticError::Http {
            url: url.clone(),
            source,
        })?;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let result = HeadResult {
        url: response.url().to_string(),
        status: response.status().as_u16(),
        headers,
        elapsed_ms,
    };
    debug!(url = %result.url, status = result.status, elapsed_ms, "HEAD finished");
    Ok(result)
}
