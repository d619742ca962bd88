// iptables drop-rule blocking backend

use super::runner::{CommandRunner, args};
use super::{BackendCapabilities, BackendPriority, EnforcementBackend};
use crate::error::EnforcementError;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;

const CHAIN: &str = "FORWARD";

/// Upper bound on duplicate rules cleared in one removal
const MAX_STALE_RULES: usize = 16;

fn program_for(address: IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => "iptables",
        IpAddr::V6(_) => "ip6tables",
    }
}

/// `<op> FORWARD -s <ip> -j DROP`
fn drop_rule(op: &str, address: IpAddr) -> Vec<String> {
    let source = address.to_string();
    args([op, CHAIN, "-s", source.as_str(), "-j", "DROP"])
}

/// Blocks a client by dropping forwarded packets from its tunnel address
pub struct IptablesBackend {
    runner: Arc<dyn CommandRunner>,
}

impl IptablesBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn is_available(runner: &dyn CommandRunner) -> bool {
        runner
            .run("iptables", &args(["--version"]))
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    /// Delete matching drop rules until none are left (bounded).
    /// A failed delete means "no such rule".
    async fn remove_drop_rules(&self, address: IpAddr) -> Result<usize, EnforcementError> {
        let program = program_for(address);
        let delete = drop_rule("-D", address);

        let mut removed = 0;
        while removed < MAX_STALE_RULES {
            let output = self.runner.run(program, &delete).await?;
            if !output.success {
                break;
            }
            removed += 1;
        }

        if removed > 0 {
            log::debug!("Removed {} drop rule(s) for {}", removed, address);
        }
        Ok(removed)
    }
}

#[async_trait]
impl EnforcementBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Good
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: true,
            blocking: true,
            throttling: false,
        }
    }

    async fn check_ready(&self) -> Result<(), EnforcementError> {
        self.runner
            .run_checked("iptables", &args(["-S", CHAIN]))
            .await
            .map(|_| ())
    }

    async fn apply_block(&self, address: IpAddr) -> Result<(), EnforcementError> {
        self.runner
            .run_checked(program_for(address), &drop_rule("-I", address))
            .await?;
        Ok(())
    }

    async fn remove_block(&self, address: IpAddr) -> Result<(), EnforcementError> {
        self.remove_drop_rules(address).await.map(|_| ())
    }
}
