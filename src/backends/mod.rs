// Enforcement backend trait definitions and selection

pub mod iptables;
pub mod runner;

#[cfg(feature = "throttle-tc-htb")]
pub mod iptables_tc;

#[cfg(feature = "throttle-tc-htb")]
pub mod linux_tc_utils;

use crate::error::EnforcementError;
use async_trait::async_trait;
use runner::CommandRunner;
use std::net::IpAddr;
use std::sync::Arc;

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Good = 1,
    Better = 2,
}

/// Capabilities that a backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub ipv4_support: bool,
    pub ipv6_support: bool,
    pub blocking: bool,
    pub throttling: bool,
}

/// Applies and removes network-level actions for a single address.
///
/// Removal must treat "no such rule" as success so callers can clear stale
/// state before inserting.
#[async_trait]
pub trait EnforcementBackend: Send + Sync {
    /// Backend name (e.g., "iptables", "iptables_tc")
    fn name(&self) -> &'static str;

    /// Backend priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    fn supports_throttling(&self) -> bool {
        self.capabilities().throttling
    }

    /// Verify the enforcement target is reachable and usable
    async fn check_ready(&self) -> Result<(), EnforcementError>;

    /// One-time setup before the first action
    async fn init(&mut self) -> Result<(), EnforcementError> {
        Ok(())
    }

    async fn apply_block(&self, address: IpAddr) -> Result<(), EnforcementError>;

    async fn remove_block(&self, address: IpAddr) -> Result<(), EnforcementError>;

    async fn apply_throttle(&self, address: IpAddr, _rate_mbps: f64) -> Result<(), EnforcementError> {
        Err(EnforcementError::unsupported(format!(
            "backend '{}' cannot shape traffic, {} is not throttled",
            self.name(),
            address
        )))
    }

    async fn remove_throttle(&self, _address: IpAddr) -> Result<(), EnforcementError> {
        Ok(())
    }
}

/// Backend metadata for selection
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

/// Detect all compiled-in backends and whether the target supports them
pub async fn detect_backends(runner: &dyn CommandRunner) -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "throttle-tc-htb")]
    {
        backends.push(BackendInfo {
            name: "iptables_tc",
            priority: BackendPriority::Better,
            available: iptables_tc::IptablesTcBackend::is_available(runner).await,
        });
    }

    backends.push(BackendInfo {
        name: "iptables",
        priority: BackendPriority::Good,
        available: iptables::IptablesBackend::is_available(runner).await,
    });

    backends
}

/// Pick the preferred backend, or the best available one, and initialize it
pub async fn select_backend(
    preference: Option<&str>,
    runner: Arc<dyn CommandRunner>,
    shaping_interface: &str,
) -> Result<Box<dyn EnforcementBackend>, EnforcementError> {
    let name = match preference {
        Some(name) => {
            log::info!("Using preferred enforcement backend: {}", name);
            name
        }
        None => {
            let available = detect_backends(runner.as_ref()).await;

            log::debug!("Available enforcement backends:");
            for backend in &available {
                log::debug!(
                    "  {} - priority: {:?}, available: {}",
                    backend.name,
                    backend.priority,
                    backend.available
                );
            }

            let best = available
                .iter()
                .filter(|b| b.available)
                .max_by_key(|b| b.priority)
                .ok_or_else(|| {
                    EnforcementError::new(
                        crate::error::EnforcementErrorKind::Unsupported,
                        format!("no enforcement backend available on {}", runner.target()),
                    )
                })?;
            log::info!("Auto-selected enforcement backend: {}", best.name);
            best.name
        }
    };

    let mut backend = create_backend(name, runner, shaping_interface)?;
    backend.init().await?;
    log::info!(
        "Enforcement backend {} ready (priority: {:?}, throttling: {})",
        backend.name(),
        backend.priority(),
        backend.supports_throttling()
    );
    Ok(backend)
}

/// Create a backend by name
#[cfg_attr(not(feature = "throttle-tc-htb"), allow(unused_variables))]
pub fn create_backend(
    name: &str,
    runner: Arc<dyn CommandRunner>,
    shaping_interface: &str,
) -> Result<Box<dyn EnforcementBackend>, EnforcementError> {
    log::debug!("Creating enforcement backend {name}");
    match name {
        "iptables" => Ok(Box::new(iptables::IptablesBackend::new(runner))),

        #[cfg(feature = "throttle-tc-htb")]
        "iptables_tc" => Ok(Box::new(iptables_tc::IptablesTcBackend::new(
            runner,
            shaping_interface,
        ))),

        _ => Err(EnforcementError::unsupported(format!(
            "unknown enforcement backend: {name}"
        ))),
    }
}
