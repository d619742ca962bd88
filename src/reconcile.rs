// Periodic reconciliation of observed usage against quota policies

use crate::enforcement::EnforcementController;
use crate::error::{EnforcementError, MetricsError, ResolutionError};
use crate::evaluator::{Decision, PolicyEvaluator};
use crate::identity::{IdentityResolver, PeerTable};
use crate::metrics::UsageSource;
use crate::policy::{PolicyStore, QuotaPolicy};
use crate::requests::{ReleaseRequest, ReleaseTarget, RequestQueue};
use crate::state::ActionKind;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Counts for one pass over the policy set
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Clients whose usage was evaluated
    pub evaluated: usize,
    /// Evaluations that changed the applied action
    pub enforced: usize,
    pub released: usize,
    /// Clients left untouched this pass (unresolved, usage unknown, no limits)
    pub skipped: usize,
    /// Actions that were attempted and did not take effect
    pub failed: usize,
}

#[derive(Debug, Error)]
enum ClientError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    Enforcement(#[from] EnforcementError),
}

enum Outcome {
    Evaluated { changed: bool },
    Released,
    Unlimited,
}

/// Owns every component and drives one pass at a time
pub struct ReconciliationLoop {
    policies: PolicyStore,
    resolver: IdentityResolver,
    metrics: Arc<dyn UsageSource>,
    evaluator: PolicyEvaluator,
    controller: EnforcementController,
    requests: Option<RequestQueue>,
    window: Option<Duration>,
    passes: u64,
}

impl ReconciliationLoop {
    pub fn new(
        policies: PolicyStore,
        resolver: IdentityResolver,
        metrics: Arc<dyn UsageSource>,
        controller: EnforcementController,
    ) -> Self {
        Self {
            policies,
            resolver,
            metrics,
            evaluator: PolicyEvaluator::new(),
            controller,
            requests: None,
            window: None,
            passes: 0,
        }
    }

    /// Evaluate usage as of `window` ago instead of the latest sample
    pub fn with_window(mut self, window: Option<Duration>) -> Self {
        self.window = window;
        self
    }

    /// Apply manual release requests from `queue` at the start of each pass
    pub fn with_requests(mut self, queue: RequestQueue) -> Self {
        self.requests = Some(queue);
        self
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    #[cfg(test)]
    pub fn controller(&self) -> &EnforcementController {
        &self.controller
    }

    /// Run passes every `interval` until `cancel` fires.
    ///
    /// Cancellation is observed between passes only. A pass that overruns the
    /// interval delays the next one rather than queueing extra passes.
    pub async fn run(&mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!(
            "Reconciling every {:?} with backend {}",
            interval,
            self.controller.backend_name()
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!(
                        "Stop requested, {} address(es) still enforced",
                        self.controller.active().len()
                    );
                    break;
                }
                _ = ticker.tick() => {}
            }

            self.run_pass().await;
        }
    }

    /// One complete pass. Never fails; every problem is logged per client.
    pub async fn run_pass(&mut self) -> PassReport {
        self.passes += 1;
        let mut report = PassReport::default();

        let policies = self.policies.load_or_cached();
        let peers = self.resolver.snapshot().await;
        if let Err(e) = &peers {
            log::warn!("{e}; no client can be resolved this pass");
        }

        report.released += self.apply_release_requests(&peers).await;

        for policy in policies.values() {
            if !policy.enabled {
                report.released += self.release_client(policy).await;
                continue;
            }

            match self.reconcile_client(policy, &peers).await {
                Ok(Outcome::Evaluated { changed }) => {
                    report.evaluated += 1;
                    if changed {
                        report.enforced += 1;
                    }
                }
                Ok(Outcome::Released) => report.released += 1,
                Ok(Outcome::Unlimited) => report.skipped += 1,
                Err(ClientError::Enforcement(e)) if e.is_unsupported() => {
                    log::warn!("Cannot enforce on {}: {}", policy.name, e.message);
                    report.failed += 1;
                }
                Err(ClientError::Enforcement(e)) => {
                    log::warn!("Enforcement failed for {} ({}): {}", policy.name, policy.client_id, e);
                    report.failed += 1;
                }
                Err(e) => {
                    log::warn!("Skipping {} ({}): {}", policy.name, policy.client_id, e);
                    report.skipped += 1;
                }
            }
        }

        log::info!(
            "Pass {}: {} evaluated, {} enforced, {} released, {} skipped, {} failed",
            self.passes,
            report.evaluated,
            report.enforced,
            report.released,
            report.skipped,
            report.failed
        );
        report
    }

    async fn reconcile_client(
        &mut self,
        policy: &QuotaPolicy,
        peers: &Result<PeerTable, ResolutionError>,
    ) -> Result<Outcome, ClientError> {
        let peers = peers.as_ref().map_err(ResolutionError::clone)?;
        let identity = peers.resolve(&policy.name)?;

        let current = self.controller.state(&identity.address);
        // An action recorded for another client survives whatever this policy says
        let owned = current
            .client
            .as_deref()
            .is_none_or(|client| client == policy.name);
        let lifted = owned
            && match current.action {
                ActionKind::Blocked => !policy.has_traffic_limit(),
                ActionKind::Throttled => !policy.has_speed_limit(),
                ActionKind::None => false,
            };
        if lifted {
            self.controller.release(identity.address).await?;
            self.evaluator.forget(&identity.address);
            log::info!("Limit lifted for {}, released {}", policy.name, identity.address);
            return Ok(Outcome::Released);
        }

        if !policy.has_traffic_limit() && !policy.has_speed_limit() {
            log::debug!("{} has no limits", policy.name);
            return Ok(Outcome::Unlimited);
        }

        let sample = self.metrics.query(identity.address, self.window).await?;
        log::debug!(
            "{} ({}) sent {} received {} bytes",
            identity.name,
            identity.address,
            sample.bytes_sent,
            sample.bytes_received
        );

        let decision = self
            .evaluator
            .evaluate(policy, &sample)
            .ok_or(MetricsError::CounterReset(identity.address))?;

        if decision != Decision::Ok {
            log::debug!("{} decision {:?}", identity.name, decision);
        }

        let state = self.controller.enforce(&identity, decision, policy).await?;
        Ok(Outcome::Evaluated {
            changed: state.action != current.action || state.rate_mbps != current.rate_mbps,
        })
    }

    /// Apply queued manual releases. A request stays queued until every
    /// address it names has been released.
    async fn apply_release_requests(&mut self, peers: &Result<PeerTable, ResolutionError>) -> usize {
        let pending = match &self.requests {
            Some(queue) => queue.pending(),
            None => return 0,
        };

        let mut released = 0;
        for (path, request) in pending {
            let addresses = release_addresses(&self.controller, &request, peers);
            if addresses.is_empty() && peers.is_err() {
                log::warn!("Cannot resolve release request for '{}' yet", request.target);
                continue;
            }
            if addresses.is_empty() {
                log::warn!(
                    "Release request for '{}' matches no address, dropping it",
                    request.target
                );
            }

            let mut done = true;
            for address in addresses {
                match self.controller.release(address).await {
                    Ok(_) => {
                        self.evaluator.forget(&address);
                        log::info!(
                            "Released {} on request for '{}' ({})",
                            address,
                            request.target,
                            request.requested_at
                        );
                        released += 1;
                    }
                    Err(e) => {
                        log::warn!("Failed to release {} for '{}': {}", address, request.target, e);
                        done = false;
                    }
                }
            }

            if let (true, Some(queue)) = (done, &self.requests) {
                queue.complete(&path);
            }
        }
        released
    }

    /// Release everything applied for a disabled client. Returns how many
    /// addresses were released.
    async fn release_client(&mut self, policy: &QuotaPolicy) -> usize {
        let mut released = 0;
        for state in self.controller.states_for_client(&policy.name) {
            match self.controller.release(state.address).await {
                Ok(_) => {
                    self.evaluator.forget(&state.address);
                    log::info!("{} disabled, released {}", policy.name, state.address);
                    released += 1;
                }
                Err(e) => log::warn!(
                    "Failed to release {} ({}): {}",
                    policy.name,
                    state.address,
                    e
                ),
            }
        }
        released
    }
}

/// Addresses a request refers to: the address itself, or for a name every
/// address recorded for that client plus its current address
fn release_addresses(
    controller: &EnforcementController,
    request: &ReleaseRequest,
    peers: &Result<PeerTable, ResolutionError>,
) -> Vec<IpAddr> {
    match request.target() {
        ReleaseTarget::Address(address) => vec![address],
        ReleaseTarget::Client(name) => {
            let mut addresses: Vec<IpAddr> = controller
                .states_for_client(&name)
                .into_iter()
                .map(|state| state.address)
                .collect();
            let current = peers
                .as_ref()
                .ok()
                .and_then(|peers| peers.resolve(&name).ok());
            if let Some(identity) = current {
                if !addresses.contains(&identity.address) {
                    addresses.push(identity.address);
                }
            }
            addresses
        }
    }
}
