// Error taxonomy for the reconciliation loop
//
// Every variant here is recoverable inside a pass. Only startup failures in
// main.rs terminate the process, and those go through anyhow.

use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Policy file could not be read or parsed. The previous policy set stays in effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read policy file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Client name could not be mapped to an address this pass.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error("no peer named '{0}' in peer configuration")]
    NotFound(String),

    #[error("peer '{name}' has an unparseable AllowedIPs entry '{value}'")]
    InvalidAddress { name: String, value: String },

    #[error("failed to read peer configuration {path:?}: {message}")]
    PeerConfig { path: PathBuf, message: String },
}

/// Usage could not be determined for an address this pass.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics backend unreachable: {0}")]
    Unreachable(String),

    #[error("metrics query timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("metrics backend returned status '{0}'")]
    Backend(String),

    #[error("malformed metrics response: {0}")]
    Malformed(String),

    #[error("no series for {0}")]
    Empty(IpAddr),

    #[error("counter reset detected for {0}")]
    CounterReset(IpAddr),
}

/// A release request could not be queued.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to write release request in {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode release request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Why an enforcement action did not take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementErrorKind {
    /// The deployment has no mechanism for the requested action
    Unsupported,
    /// The command ran and exited non-zero
    CommandFailed,
    /// The command did not finish within the configured timeout
    Timeout,
    /// The command could not be started at all
    Spawn,
    /// The state store could not be read or written
    State,
}

#[derive(Debug, Error)]
#[error("enforcement {kind:?}: {message}")]
pub struct EnforcementError {
    pub kind: EnforcementErrorKind,
    pub message: String,
}

impl EnforcementError {
    pub fn new(kind: EnforcementErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(EnforcementErrorKind::Unsupported, message)
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind == EnforcementErrorKind::Unsupported
    }
}
