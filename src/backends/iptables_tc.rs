// iptables blocking combined with TC HTB shaping on the tunnel interface

use super::iptables::IptablesBackend;
use super::linux_tc_utils::*;
use super::runner::CommandRunner;
use super::{BackendCapabilities, BackendPriority, EnforcementBackend};
use crate::error::EnforcementError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

/// Blocks with iptables, throttles with an HTB class per client address.
///
/// Shaping applies to traffic leaving the tunnel interface towards the
/// client, i.e. the client's download direction.
pub struct IptablesTcBackend {
    blocking: IptablesBackend,
    runner: Arc<dyn CommandRunner>,
    interface: String,
    initialized: bool,
    /// Class minor id -> address currently shaped with it
    owners: Mutex<HashMap<u32, Ipv4Addr>>,
}

impl IptablesTcBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, interface: &str) -> Self {
        Self {
            blocking: IptablesBackend::new(runner.clone()),
            runner,
            interface: interface.to_string(),
            initialized: false,
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_available(runner: &dyn CommandRunner) -> bool {
        IptablesBackend::is_available(runner).await && check_tc_available(runner).await
    }

    fn ensure_initialized(&self) -> Result<(), EnforcementError> {
        if !self.initialized {
            return Err(EnforcementError::new(
                crate::error::EnforcementErrorKind::State,
                format!("{} used before init", self.name()),
            ));
        }
        Ok(())
    }

    fn owner_of(&self, minor: u32) -> Option<Ipv4Addr> {
        self.owners
            .lock()
            .ok()
            .and_then(|owners| owners.get(&minor).copied())
    }

    fn set_owner(&self, minor: u32, owner: Option<Ipv4Addr>) {
        if let Ok(mut owners) = self.owners.lock() {
            match owner {
                Some(address) => owners.insert(minor, address),
                None => owners.remove(&minor),
            };
        }
    }
}

#[async_trait]
impl EnforcementBackend for IptablesTcBackend {
    fn name(&self) -> &'static str {
        "iptables_tc"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Better
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: true, // blocking only; shaping rejects IPv6
            blocking: true,
            throttling: true,
        }
    }

    async fn check_ready(&self) -> Result<(), EnforcementError> {
        self.blocking.check_ready().await?;
        self.runner
            .run_checked(
                "tc",
                &super::runner::args(["qdisc", "show", "dev", self.interface.as_str()]),
            )
            .await
            .map(|_| ())
    }

    async fn init(&mut self) -> Result<(), EnforcementError> {
        if self.initialized {
            return Ok(());
        }
        setup_tc_htb_root(self.runner.as_ref(), &self.interface).await?;
        self.initialized = true;
        Ok(())
    }

    async fn apply_block(&self, address: IpAddr) -> Result<(), EnforcementError> {
        self.blocking.apply_block(address).await
    }

    async fn remove_block(&self, address: IpAddr) -> Result<(), EnforcementError> {
        self.blocking.remove_block(address).await
    }

    async fn apply_throttle(&self, address: IpAddr, rate_mbps: f64) -> Result<(), EnforcementError> {
        self.ensure_initialized()?;
        let v4 = require_ipv4(address)?;
        let minor = class_minor(v4)?;

        if let Some(owner) = self.owner_of(minor).filter(|owner| *owner != v4) {
            return Err(EnforcementError::unsupported(format!(
                "{v4} maps to tc class {minor:#x}, already shaping {owner}"
            )));
        }

        add_address_shaping(self.runner.as_ref(), &self.interface, v4, rate_mbps).await?;
        self.set_owner(minor, Some(v4));
        Ok(())
    }

    async fn remove_throttle(&self, address: IpAddr) -> Result<(), EnforcementError> {
        // Never shaped, nothing to remove
        let IpAddr::V4(v4) = address else {
            return Ok(());
        };
        let Ok(minor) = class_minor(v4) else {
            return Ok(());
        };

        // Unowned ids may be leftovers from an earlier run and are cleared
        if let Some(owner) = self.owner_of(minor).filter(|owner| *owner != v4) {
            log::debug!("tc class {minor:#x} belongs to {owner}, not removing for {v4}");
            return Ok(());
        }

        remove_address_shaping(self.runner.as_ref(), &self.interface, v4).await?;
        self.set_owner(minor, None);
        Ok(())
    }
}
