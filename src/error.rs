use crate::timeout::Phase;
use std::fmt;
use std::io;

/// Failures on the request path.
///
/// Every variant maps to an HTTP status (`status_code`) for the case where
/// nothing has been written to the client yet, and to a `type` label on
/// `proxy_upstream_errors_total` (`error_kind`).
#[derive(Debug)]
pub enum ProxyError {
    /// A phase deadline elapsed; the wrapped operation was cancelled.
    Timeout(Phase),
    /// TCP establishment to the upstream failed (refused, unreachable, ...).
    Connect(io::Error),
    /// Writing the request to the upstream failed.
    Write(io::Error),
    /// Reading a response chunk from the upstream failed.
    Read(io::Error),
    /// The upstream's circuit breaker refused the call.
    CircuitOpen { name: String },
    /// The client went away mid-response.
    Client(io::Error),
}

impl ProxyError {
    /// Status to emit when no response byte has reached the client yet.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Timeout(_) => 504,
            _ => 502,
        }
    }

    pub fn status_reason(&self) -> &'static str {
        match self.status_code() {
            504 => "Gateway Timeout",
            _ => "Bad Gateway",
        }
    }

    /// `type` label for `proxy_upstream_errors_total`.
    pub fn error_kind(&self) -> &'static str {
        match self {
            ProxyError::Timeout(_) => "timeout",
            ProxyError::Connect(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                "connection_refused"
            }
            ProxyError::Connect(_) => "network",
            ProxyError::CircuitOpen { .. } => "circuit",
            ProxyError::Client(_) => "client",
            _ => "other",
        }
    }

    pub fn timeout_phase(&self) -> Option<Phase> {
        match self {
            ProxyError::Timeout(phase) => Some(*phase),
            _ => None,
        }
    }

    /// One-line diagnostic for the error response body.
    pub fn body_line(&self) -> String {
        match self {
            ProxyError::Timeout(_) => "Upstream timeout".to_string(),
            ProxyError::Connect(e) => format!("Upstream unavailable: {}", e),
            ProxyError::CircuitOpen { name } => {
                format!("Upstream unavailable: circuit {} is open", name)
            }
            ProxyError::Write(e) | ProxyError::Read(e) => format!("Upstream error: {}", e),
            ProxyError::Client(e) => format!("Client error: {}", e),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Timeout(phase) => write!(f, "{} timeout", phase.as_str()),
            ProxyError::Connect(e) => write!(f, "upstream connect error: {}", e),
            ProxyError::Write(e) => write!(f, "upstream write error: {}", e),
            ProxyError::Read(e) => write!(f, "upstream read error: {}", e),
            ProxyError::CircuitOpen { name } => write!(f, "circuit {} is open", name),
            ProxyError::Client(e) => write!(f, "client error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Connect(e)
            | ProxyError::Write(e)
            | ProxyError::Read(e)
            | ProxyError::Client(e) => Some(e),
            _ => None,
        }
    }
}
