// EnforcementController turns decisions into idempotent network actions

use crate::backends::EnforcementBackend;
use crate::error::EnforcementError;
use crate::evaluator::Decision;
use crate::identity::ClientIdentity;
use crate::policy::QuotaPolicy;
use crate::state::{ActionKind, EnforcementState, StateStore};
use chrono::Utc;
use std::net::IpAddr;

/// Single writer for enforcement state.
///
/// Every action first consults the store: an address already in the target
/// state is left alone, so repeated passes never re-issue commands. A block
/// is sticky; usage dropping back under the limit does not lift it, only
/// `release` does.
pub struct EnforcementController {
    backend: Box<dyn EnforcementBackend>,
    store: Box<dyn StateStore>,
}

impl EnforcementController {
    pub fn new(backend: Box<dyn EnforcementBackend>, store: Box<dyn StateStore>) -> Self {
        Self { backend, store }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn state(&self, address: &IpAddr) -> EnforcementState {
        self.store.get(address)
    }

    /// Active entries recorded for a client name
    pub fn states_for_client(&self, client: &str) -> Vec<EnforcementState> {
        self.store.find_by_client(client)
    }

    pub fn active(&self) -> Vec<EnforcementState> {
        self.store.all()
    }

    /// Apply `decision` to the client's current address
    pub async fn enforce(
        &mut self,
        client: &ClientIdentity,
        decision: Decision,
        policy: &QuotaPolicy,
    ) -> Result<EnforcementState, EnforcementError> {
        let current = self.store.get(&client.address);

        match decision {
            Decision::Ok => Ok(current),
            Decision::BreachTraffic => self.block(client, current).await,
            Decision::BreachSpeed => self.throttle(client, current, policy.speed_limit_mbps).await,
        }
    }

    async fn block(
        &mut self,
        client: &ClientIdentity,
        current: EnforcementState,
    ) -> Result<EnforcementState, EnforcementError> {
        let address = client.address;

        if current.action == ActionKind::Blocked {
            log::debug!("{} ({}) already blocked", client.name, address);
            return Ok(current);
        }
        if !self.backend.capabilities().blocking {
            return Err(EnforcementError::unsupported(format!(
                "backend '{}' cannot block {}",
                self.backend.name(),
                address
            )));
        }
        self.check_address_family(address)?;

        if current.action == ActionKind::Throttled {
            // One action per address: drop the shaping before blocking
            self.backend.remove_throttle(address).await?;
            self.store.put(EnforcementState::none(address))?;
        }

        // Clear anything a previous run left behind, then insert fresh
        self.backend.remove_block(address).await?;
        self.backend.apply_block(address).await?;

        let state = EnforcementState {
            address,
            action: ActionKind::Blocked,
            applied_at: Some(Utc::now()),
            client: Some(client.name.clone()),
            rate_mbps: None,
        };
        self.store.put(state.clone())?;

        log::info!(
            "Blocked {} ({}) via {}",
            client.name,
            address,
            self.backend.name()
        );
        Ok(state)
    }

    async fn throttle(
        &mut self,
        client: &ClientIdentity,
        current: EnforcementState,
        rate_mbps: f64,
    ) -> Result<EnforcementState, EnforcementError> {
        let address = client.address;

        if !self.backend.supports_throttling() {
            return Err(EnforcementError::unsupported(format!(
                "{} ({}) exceeds its speed limit of {} Mbps but backend '{}' cannot throttle",
                client.name,
                address,
                rate_mbps,
                self.backend.name()
            )));
        }

        match current.action {
            // A block already stops all traffic
            ActionKind::Blocked => return Ok(current),
            ActionKind::Throttled if current.rate_mbps == Some(rate_mbps) => {
                log::debug!("{} ({}) already throttled", client.name, address);
                return Ok(current);
            }
            _ => {}
        }
        self.check_address_family(address)?;

        self.backend.remove_throttle(address).await?;
        self.backend.apply_throttle(address, rate_mbps).await?;

        let state = EnforcementState {
            address,
            action: ActionKind::Throttled,
            applied_at: Some(Utc::now()),
            client: Some(client.name.clone()),
            rate_mbps: Some(rate_mbps),
        };
        self.store.put(state.clone())?;

        log::info!(
            "Throttled {} ({}) to {} Mbps via {}",
            client.name,
            address,
            rate_mbps,
            self.backend.name()
        );
        Ok(state)
    }

    /// Remove whatever is applied to `address` and reset its state to none.
    ///
    /// Removal commands are always issued, so a manual reset also clears rules
    /// left by an earlier process that this one has no record of.
    pub async fn release(&mut self, address: IpAddr) -> Result<EnforcementState, EnforcementError> {
        let current = self.store.get(&address);

        self.backend.remove_block(address).await?;
        if self.backend.supports_throttling() {
            self.backend.remove_throttle(address).await?;
        }

        let state = EnforcementState::none(address);
        self.store.put(state.clone())?;

        if current.is_active() {
            log::info!(
                "Released {} ({:?}, client {})",
                address,
                current.action,
                current.client.as_deref().unwrap_or("unknown")
            );
        }
        Ok(state)
    }

    fn check_address_family(&self, address: IpAddr) -> Result<(), EnforcementError> {
        let caps = self.backend.capabilities();
        let supported = match address {
            IpAddr::V4(_) => caps.ipv4_support,
            IpAddr::V6(_) => caps.ipv6_support,
        };
        if !supported {
            return Err(EnforcementError::unsupported(format!(
                "backend '{}' cannot act on {}",
                self.backend.name(),
                address
            )));
        }
        Ok(())
    }
}
