pub mod types;


pub use types::*;

use crate::upstream::Upstream;
use anyhow::{bail, Context, Result};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Positional CLI arguments, already disambiguated.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
}

impl CliOverrides {
    /// `proxy [config_path] [listen_host] [listen_port]`. A first
    /// argument that parses as a port number or an IP address is not a
    /// config path and is taken as the listen override instead.
    pub fn from_positionals(
        first: Option<String>,
        second: Option<String>,
        third: Option<u16>,
    ) -> Self {
        let Some(token) = first else {
            return Self::default();
        };

        if let Ok(port) = token.parse::<u16>() {
            return Self {
                config_path: None,
                listen_host: second,
                listen_port: Some(port),
            };
        }
        if token.parse::<IpAddr>().is_ok() {
            let port = second.as_deref().and_then(|s| s.parse::<u16>().ok()).or(third);
            return Self {
                config_path: None,
                listen_host: Some(token),
                listen_port: port,
            };
        }
        Self {
            config_path: Some(PathBuf::from(token)),
            listen_host: second,
            listen_port: third,
        }
    }
}

/// Environment fallbacks, lowest precedence above built-in defaults.
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    listen_host: Option<String>,
    listen_port: Option<u16>,
    metrics_host: Option<String>,
    metrics_port: Option<u16>,
    upstreams: Option<Vec<Upstream>>,
    log_level: Option<LogLevel>,
}

impl EnvOverrides {
    fn capture() -> Self {
        Self {
            listen_host: std::env::var("PROXY_LISTEN_HOST").ok(),
            listen_port: std::env::var("PROXY_LISTEN_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            metrics_host: std::env::var("METRICS_LISTEN_HOST").ok(),
            metrics_port: std::env::var("METRICS_LISTEN_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
            upstreams: std::env::var("UPSTREAM_HOSTS")
                .ok()
                .map(|v| parse_upstream_list(&v)),
            log_level: std::env::var("LOG_LEVEL").ok().and_then(|v| v.parse().ok()),
        }
    }
}

/// Entries that do not look like `host:port` are skipped.
fn parse_upstream_list(raw: &str) -> Vec<Upstream> {
    raw.split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (host, port) = part.rsplit_once(':')?;
            let port: u16 = port.parse().ok()?;
            if host.is_empty() || port == 0 {
                return None;
            }
            Some(Upstream::new(host, port))
        })
        .collect()
}

/// Fully resolved, validated settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub listen_host: String,
    pub listen_port: u16,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub upstreams: Vec<Upstream>,
    pub timeouts: TimeoutsConfig,
    pub limits: LimitsConfig,
    pub log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            metrics_host: "127.0.0.1".to_string(),
            metrics_port: 8081,
            upstreams: vec![Upstream::new("127.0.0.1", 9001)],
            timeouts: TimeoutsConfig::default(),
            limits: LimitsConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

/// Load and resolve configuration: CLI > config file > env > defaults.
/// Any file error (missing, unreadable, bad YAML, unknown key, failed
/// validation) is an error here; the caller decides whether that is fatal
/// (startup) or ignorable (reload keeps the previous config).
pub fn load(cli: &CliOverrides) -> Result<Settings> {
    let raw = match &cli.config_path {
        Some(path) => parse_file(path)?,
        None => RawConfig::default(),
    };
    resolve(raw, cli, &EnvOverrides::capture())
}

fn parse_file(path: &Path) -> Result<RawConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve(raw: RawConfig, cli: &CliOverrides, env: &EnvOverrides) -> Result<Settings> {
    let defaults = Settings::default();

    let (file_listen_host, file_listen_port) = split_listen(raw.listen.as_deref())?;
    let (file_metrics_host, file_metrics_port) = split_listen(raw.metrics_listen.as_deref())?;

    let listen_host = cli
        .listen_host
        .clone()
        .or(file_listen_host)
        .or_else(|| env.listen_host.clone())
        .unwrap_or(defaults.listen_host);
    let listen_port = cli
        .listen_port
        .or(file_listen_port)
        .or(env.listen_port)
        .unwrap_or(defaults.listen_port);

    let metrics_host = file_metrics_host
        .or_else(|| env.metrics_host.clone())
        .unwrap_or(defaults.metrics_host);
    let metrics_port = file_metrics_port
        .or(env.metrics_port)
        .unwrap_or(defaults.metrics_port);

    let upstreams = raw
        .upstreams
        .map(|entries| {
            entries
                .into_iter()
                .map(|e| Upstream::new(e.host, e.port))
                .collect::<Vec<_>>()
        })
        .or_else(|| env.upstreams.clone())
        .unwrap_or(defaults.upstreams);

    let settings = Settings {
        listen_host,
        listen_port,
        metrics_host,
        metrics_port,
        upstreams,
        timeouts: raw.timeouts.unwrap_or_default(),
        limits: raw.limits.unwrap_or_default(),
        log_level: raw
            .logging
            .map(|l| l.level)
            .or(env.log_level)
            .unwrap_or(defaults.log_level),
    };

    settings.validate()?;
    Ok(settings)
}

fn split_listen(value: Option<&str>) -> Result<(Option<String>, Option<u16>)> {
    match value {
        Some(v) => {
            let (host, port) = parse_listen(v)?;
            Ok((Some(host), Some(port)))
        }
        None => Ok((None, None)),
    }
}

/// Parse `host:port` (or a bare port) into its parts.
pub fn parse_listen(value: &str) -> Result<(String, u16)> {
    let value = value.trim();
    if let Some((host, port)) = value.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in listen address {:?}", value))?;
        if port == 0 {
            bail!("port 0 is not a valid listen port in {:?}", value);
        }
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        return Ok((host.to_string(), port));
    }
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        let port: u16 = value
            .parse()
            .with_context(|| format!("invalid listen port {:?}", value))?;
        if port == 0 {
            bail!("port 0 is not a valid listen port");
        }
        return Ok(("127.0.0.1".to_string(), port));
    }
    bail!("invalid listen address {:?}, expected host:port", value)
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            bail!("at least one upstream is required");
        }
        for upstream in &self.upstreams {
            if upstream.host.is_empty() {
                bail!("upstream host cannot be empty");
            }
            if upstream.port == 0 {
                bail!("upstream port must be in 1..=65535, got 0 for {:?}", upstream.host);
            }
        }
        if self.limits.max_client_conns == 0 {
            bail!("limits.max_client_conns must be positive");
        }
        if self.limits.max_conns_per_upstream == 0 {
            bail!("limits.max_conns_per_upstream must be positive");
        }
        Ok(())
    }
}
