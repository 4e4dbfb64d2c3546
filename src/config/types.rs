use serde::Deserialize;
use std::str::FromStr;

/// Raw YAML shape. Top-level fields are `Option` so that precedence
/// (CLI > file > env > defaults) can be resolved per field; unknown keys
/// anywhere are a load error so typos surface at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub metrics_listen: Option<String>,

    #[serde(default)]
    pub upstreams: Option<Vec<UpstreamEntry>>,

    #[serde(default)]
    pub timeouts: Option<TimeoutsConfig>,

    #[serde(default)]
    pub limits: Option<LimitsConfig>,

    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamEntry {
    #[serde(default = "default_upstream_host")]
    pub host: String,

    #[serde(default = "default_upstream_port")]
    pub port: u16,
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_upstream_port() -> u16 {
    9001
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,

    #[serde(default = "default_read_ms")]
    pub read_ms: u64,

    #[serde(default = "default_write_ms")]
    pub write_ms: u64,

    #[serde(default = "default_total_ms")]
    pub total_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            read_ms: default_read_ms(),
            write_ms: default_write_ms(),
            total_ms: default_total_ms(),
        }
    }
}

fn default_connect_ms() -> u64 {
    1000
}

fn default_read_ms() -> u64 {
    15_000
}

fn default_write_ms() -> u64 {
    15_000
}

fn default_total_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default = "default_max_client_conns")]
    pub max_client_conns: usize,

    #[serde(default = "default_max_conns_per_upstream")]
    pub max_conns_per_upstream: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_client_conns: default_max_client_conns(),
            max_conns_per_upstream: default_max_conns_per_upstream(),
        }
    }
}

fn default_max_client_conns() -> usize {
    1000
}

fn default_max_conns_per_upstream() -> usize {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "unknown log level {:?}, expected debug|info|warning|error",
                other
            )),
        }
    }
}
