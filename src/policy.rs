// Quota policy loading and validation

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A single client's quota as enforced by the loop
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    pub client_id: String,
    pub name: String,
    /// Megabits per second, 0 = unlimited
    pub speed_limit_mbps: f64,
    /// Bytes (sent + received), 0 = unlimited
    pub traffic_limit_bytes: u64,
    pub enabled: bool,
}

impl QuotaPolicy {
    pub fn has_traffic_limit(&self) -> bool {
        self.traffic_limit_bytes > 0
    }

    pub fn has_speed_limit(&self) -> bool {
        self.speed_limit_mbps > 0.0
    }
}

/// All policies keyed by client_id, ordered so passes are deterministic
pub type PolicySet = BTreeMap<String, QuotaPolicy>;

/// On-disk entry shape written by the admin UI
#[derive(Debug, Deserialize)]
struct PolicyEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    speed_limit: f64,
    /// GiB
    #[serde(default)]
    traffic_limit: f64,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl PolicyEntry {
    fn validate(self, client_id: &str) -> Result<QuotaPolicy, String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("name is empty".to_string());
        }
        if !self.speed_limit.is_finite() || self.speed_limit < 0.0 {
            return Err(format!("speed_limit {} is negative", self.speed_limit));
        }
        if !self.traffic_limit.is_finite() || self.traffic_limit < 0.0 {
            return Err(format!("traffic_limit {} is negative", self.traffic_limit));
        }

        // Any positive limit stays a limit, however small
        let mut traffic_limit_bytes = (self.traffic_limit * BYTES_PER_GIB).round() as u64;
        if self.traffic_limit > 0.0 {
            traffic_limit_bytes = traffic_limit_bytes.max(1);
        }

        Ok(QuotaPolicy {
            client_id: client_id.to_string(),
            name: name.to_string(),
            speed_limit_mbps: self.speed_limit,
            traffic_limit_bytes,
            enabled: self.enabled,
        })
    }
}

/// Reads the policy file and remembers the last set that parsed
pub struct PolicyStore {
    path: PathBuf,
    cached: PolicySet,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: PolicySet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load policies from disk.
    ///
    /// A missing file is an empty policy set. Entries that fail validation are
    /// dropped one by one; only an unreadable file or a document that is not a
    /// JSON object fails the whole load.
    pub fn load(&mut self) -> Result<PolicySet, ConfigError> {
        if !self.path.exists() {
            log::info!("No policy file at {:?}, nothing to enforce", self.path);
            self.cached = PolicySet::new();
            return Ok(self.cached.clone());
        }

        let contents = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        let policies = parse_policies(&contents).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        log::debug!("Loaded {} policy(s) from {:?}", policies.len(), self.path);
        self.cached = policies;
        Ok(self.cached.clone())
    }

    /// Load policies, falling back to the last good set when the file is bad
    pub fn load_or_cached(&mut self) -> PolicySet {
        match self.load() {
            Ok(policies) => policies,
            Err(e) => {
                log::error!("{e}; keeping {} previously loaded policy(s)", self.cached.len());
                self.cached.clone()
            }
        }
    }
}

fn parse_policies(contents: &str) -> Result<PolicySet, serde_json::Error> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(contents)?;

    let mut policies = PolicySet::new();
    for (client_id, value) in raw {
        let entry = match serde_json::from_value::<PolicyEntry>(value) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Dropping policy '{client_id}': {e}");
                continue;
            }
        };

        match entry.validate(&client_id) {
            Ok(policy) => {
                policies.insert(client_id, policy);
            }
            Err(reason) => log::warn!("Dropping policy '{client_id}': {reason}"),
        }
    }

    Ok(policies)
}
