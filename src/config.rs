// Runtime settings, built once at startup and handed to constructors

use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POLICY_PATH: &str = "/etc/wireguard/limits.json";
pub const DEFAULT_PEER_CONFIG_PATH: &str = "/etc/wireguard/wg0.conf";
pub const DEFAULT_METRICS_ENDPOINT: &str = "http://vpn-prometheus:9090/api/v1/query";
pub const DEFAULT_ENFORCEMENT_TARGET: &str = "wg-easy";
pub const DEFAULT_REQUEST_DIR: &str = "/run/wg-quota/requests";

#[derive(Debug, Clone)]
pub struct Settings {
    pub policy_path: PathBuf,
    pub peer_config_path: PathBuf,
    pub metrics_endpoint: String,
    /// Container the firewall commands run in; None = host
    pub enforcement_target: Option<String>,
    pub poll_interval: Duration,
    pub metrics_timeout: Duration,
    pub command_timeout: Duration,
    /// Evaluate usage as of this long ago; None = latest sample
    pub query_offset: Option<Duration>,
    pub backend: Option<String>,
    pub shaping_interface: String,
    /// Persist enforcement state here; None = memory only
    pub state_path: Option<PathBuf>,
    /// Release requests queued by `wg-quota release`
    pub request_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy_path: PathBuf::from(DEFAULT_POLICY_PATH),
            peer_config_path: PathBuf::from(DEFAULT_PEER_CONFIG_PATH),
            metrics_endpoint: DEFAULT_METRICS_ENDPOINT.to_string(),
            enforcement_target: Some(DEFAULT_ENFORCEMENT_TARGET.to_string()),
            poll_interval: Duration::from_secs(30),
            metrics_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            query_offset: None,
            backend: None,
            shaping_interface: "wg0".to_string(),
            state_path: None,
            request_dir: PathBuf::from(DEFAULT_REQUEST_DIR),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("poll interval", self.poll_interval),
            ("metrics timeout", self.metrics_timeout),
            ("command timeout", self.command_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }

        let url = reqwest::Url::parse(&self.metrics_endpoint).map_err(|e| {
            ConfigError::Invalid(format!(
                "metrics endpoint '{}': {}",
                self.metrics_endpoint, e
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "metrics endpoint '{}' must be http or https",
                self.metrics_endpoint
            )));
        }

        if self.shaping_interface.trim().is_empty() {
            return Err(ConfigError::Invalid("shaping interface is empty".to_string()));
        }

        Ok(())
    }
}

/// Empty strings mean "not set" for optional flags coming from the environment
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
