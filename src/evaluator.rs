// Breach decisions from usage samples

use crate::metrics::UsageSample;
use crate::policy::QuotaPolicy;
use std::collections::HashMap;
use std::net::IpAddr;

/// Outcome of evaluating one client for one pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Ok,
    BreachTraffic,
    BreachSpeed,
}

/// Keeps the previous sample per address so rates and counter resets can be detected
#[derive(Debug, Default)]
pub struct PolicyEvaluator {
    previous: HashMap<IpAddr, UsageSample>,
}

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `sample` against `policy`.
    ///
    /// Returns None when usage is unknown this pass (counter went backwards).
    /// Traffic breaches win over speed breaches.
    pub fn evaluate(&mut self, policy: &QuotaPolicy, sample: &UsageSample) -> Option<Decision> {
        let previous = self.previous.insert(sample.address, sample.clone());

        if let Some(prev) = &previous {
            if sample.total() < prev.total() {
                log::warn!(
                    "Counter reset for {} ({} -> {} bytes), skipping this pass",
                    sample.address,
                    prev.total(),
                    sample.total()
                );
                return None;
            }
        }

        if policy.has_traffic_limit() && sample.total() > policy.traffic_limit_bytes {
            return Some(Decision::BreachTraffic);
        }

        if policy.has_speed_limit() {
            if let Some(rate) = previous.as_ref().and_then(|prev| rate_bytes_per_sec(prev, sample)) {
                let limit = mbps_to_bytes_per_sec(policy.speed_limit_mbps);
                log::debug!(
                    "{} rate {:.0} B/s (limit {:.0} B/s)",
                    sample.address,
                    rate,
                    limit
                );
                if rate > limit {
                    return Some(Decision::BreachSpeed);
                }
            }
        }

        Some(Decision::Ok)
    }

    /// Drop history for an address that is no longer tracked
    pub fn forget(&mut self, address: &IpAddr) {
        self.previous.remove(address);
    }
}

pub fn mbps_to_bytes_per_sec(mbps: f64) -> f64 {
    mbps * 1_000_000.0 / 8.0
}

fn rate_bytes_per_sec(prev: &UsageSample, current: &UsageSample) -> Option<f64> {
    let elapsed = (current.sampled_at - prev.sampled_at).num_milliseconds();
    if elapsed <= 0 {
        return None;
    }
    let delta = current.total() - prev.total();
    Some(delta as f64 * 1000.0 / elapsed as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn policy(traffic_gib: u64, speed_mbps: f64) -> QuotaPolicy {
        QuotaPolicy {
            client_id: "id1".to_string(),
            name: "alice".to_string(),
            speed_limit_mbps: speed_mbps,
            traffic_limit_bytes: traffic_gib * 1024 * 1024 * 1024,
            enabled: true,
        }
    }

    fn sample(total: u64, at: DateTime<Utc>) -> UsageSample {
        UsageSample {
            address: "10.8.0.2".parse().unwrap(),
            bytes_sent: total / 2,
            bytes_received: total - total / 2,
            sampled_at: at,
        }
    }

    #[test]
    fn test_traffic_breach_over_one_gib() {
        let mut evaluator = PolicyEvaluator::new();
        let decision = evaluator.evaluate(&policy(1, 0.0), &sample(1_200_000_000, Utc::now()));
        assert_eq!(decision, Some(Decision::BreachTraffic));
    }

    #[test]
    fn test_under_limit_is_ok() {
        let mut evaluator = PolicyEvaluator::new();
        let decision = evaluator.evaluate(&policy(1, 0.0), &sample(500_000_000, Utc::now()));
        assert_eq!(decision, Some(Decision::Ok));
    }

    #[test]
    fn test_zero_limit_never_breaches() {
        let mut evaluator = PolicyEvaluator::new();
        let decision = evaluator.evaluate(&policy(0, 0.0), &sample(u64::MAX / 2, Utc::now()));
        assert_eq!(decision, Some(Decision::Ok));
    }

    #[test]
    fn test_speed_needs_two_samples() {
        let mut evaluator = PolicyEvaluator::new();
        let start = Utc::now();
        let p = policy(0, 1.0); // 125_000 B/s

        assert_eq!(evaluator.evaluate(&p, &sample(0, start)), Some(Decision::Ok));
        // 10 MB in 10 s = 1 MB/s
        assert_eq!(
            evaluator.evaluate(&p, &sample(10_000_000, start + Duration::seconds(10))),
            Some(Decision::BreachSpeed)
        );
        // 1 MB in 10 s = 100 KB/s
        assert_eq!(
            evaluator.evaluate(&p, &sample(11_000_000, start + Duration::seconds(20))),
            Some(Decision::Ok)
        );
    }

    #[test]
    fn test_speed_ignores_non_advancing_clock() {
        let mut evaluator = PolicyEvaluator::new();
        let at = Utc::now();
        let p = policy(0, 1.0);

        evaluator.evaluate(&p, &sample(0, at));
        assert_eq!(
            evaluator.evaluate(&p, &sample(50_000_000, at)),
            Some(Decision::Ok)
        );
    }

    #[test]
    fn test_counter_reset_is_unknown() {
        let mut evaluator = PolicyEvaluator::new();
        let start = Utc::now();
        let p = policy(1, 1.0);

        evaluator.evaluate(&p, &sample(900_000_000, start));
        assert_eq!(
            evaluator.evaluate(&p, &sample(1_000, start + Duration::seconds(30))),
            None
        );
        // The post-reset sample becomes the new baseline
        assert_eq!(
            evaluator.evaluate(&p, &sample(2_000, start + Duration::seconds(60))),
            Some(Decision::Ok)
        );
    }

    #[test]
    fn test_traffic_takes_precedence() {
        let mut evaluator = PolicyEvaluator::new();
        let start = Utc::now();
        let p = policy(1, 1.0);

        evaluator.evaluate(&p, &sample(0, start));
        assert_eq!(
            evaluator.evaluate(&p, &sample(2_000_000_000, start + Duration::seconds(1))),
            Some(Decision::BreachTraffic)
        );
    }

    #[test]
    fn test_forget_clears_baseline() {
        let mut evaluator = PolicyEvaluator::new();
        let start = Utc::now();
        let p = policy(0, 1.0);
        let s = sample(900_000_000, start);

        evaluator.evaluate(&p, &s);
        evaluator.forget(&s.address);
        assert_eq!(
            evaluator.evaluate(&p, &sample(10, start + Duration::seconds(5))),
            Some(Decision::Ok)
        );
    }
}
