// Enforcement state tracking (in-memory or persisted to JSON)

use crate::error::{EnforcementError, EnforcementErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;

/// What is currently applied to an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    None,
    Blocked,
    Throttled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementState {
    pub address: IpAddr,
    pub action: ActionKind,
    pub applied_at: Option<DateTime<Utc>>,
    /// Client the action was applied for, so it can be released after the
    /// client stops resolving
    #[serde(default)]
    pub client: Option<String>,
    /// Shaping rate, only set while throttled
    #[serde(default)]
    pub rate_mbps: Option<f64>,
}

impl EnforcementState {
    pub fn none(address: IpAddr) -> Self {
        Self {
            address,
            action: ActionKind::None,
            applied_at: None,
            client: None,
            rate_mbps: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.action != ActionKind::None
    }
}

/// Single-writer store owned by the enforcement controller
pub trait StateStore: Send {
    /// Current state, `ActionKind::None` when nothing is tracked
    fn get(&self, address: &IpAddr) -> EnforcementState;

    /// Record a transition. Storing `ActionKind::None` forgets the address.
    fn put(&mut self, state: EnforcementState) -> Result<(), EnforcementError>;

    /// Active entries that were applied for `client`
    fn find_by_client(&self, client: &str) -> Vec<EnforcementState> {
        self.all()
            .into_iter()
            .filter(|s| s.client.as_deref() == Some(client))
            .collect()
    }

    /// Every active entry
    fn all(&self) -> Vec<EnforcementState>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: BTreeMap<IpAddr, EnforcementState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, address: &IpAddr) -> EnforcementState {
        self.entries
            .get(address)
            .cloned()
            .unwrap_or_else(|| EnforcementState::none(*address))
    }

    fn put(&mut self, state: EnforcementState) -> Result<(), EnforcementError> {
        if state.is_active() {
            self.entries.insert(state.address, state);
        } else {
            self.entries.remove(&state.address);
        }
        Ok(())
    }

    fn all(&self) -> Vec<EnforcementState> {
        self.entries.values().cloned().collect()
    }
}

/// Memory store mirrored to a JSON file after every change
pub struct JsonStateStore {
    path: PathBuf,
    inner: MemoryStateStore,
}

impl JsonStateStore {
    /// Open the store, starting empty when the file does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EnforcementError> {
        let path = path.into();
        let mut inner = MemoryStateStore::new();

        if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|e| {
                state_error(format!("failed to read state file {:?}: {}", path, e))
            })?;
            let entries: Vec<EnforcementState> = serde_json::from_str(&contents).map_err(|e| {
                state_error(format!("failed to parse state file {:?}: {}", path, e))
            })?;
            for entry in entries {
                inner.put(entry)?;
            }
            log::info!(
                "Loaded {} enforcement record(s) from {:?}",
                inner.entries.len(),
                path
            );
        }

        Ok(Self { path, inner })
    }

    fn save(&self) -> Result<(), EnforcementError> {
        let contents = serde_json::to_string_pretty(&self.inner.all())
            .map_err(|e| state_error(format!("failed to serialize state: {e}")))?;

        // Write-then-rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                state_error(format!("failed to write state file {:?}: {}", self.path, e))
            })
    }
}

impl StateStore for JsonStateStore {
    fn get(&self, address: &IpAddr) -> EnforcementState {
        self.inner.get(address)
    }

    fn put(&mut self, state: EnforcementState) -> Result<(), EnforcementError> {
        let previous = self.inner.get(&state.address);
        self.inner.put(state)?;
        if let Err(e) = self.save() {
            // Keep memory and disk in agreement
            self.inner.put(previous)?;
            return Err(e);
        }
        Ok(())
    }

    fn all(&self) -> Vec<EnforcementState> {
        self.inner.all()
    }
}

fn state_error(message: String) -> EnforcementError {
    EnforcementError::new(EnforcementErrorKind::State, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blocked(addr: &str, client: &str) -> EnforcementState {
        EnforcementState {
            address: addr.parse().unwrap(),
            action: ActionKind::Blocked,
            applied_at: Some(Utc::now()),
            client: Some(client.to_string()),
            rate_mbps: None,
        }
    }

    #[test]
    fn test_memory_store_defaults_to_none() {
        let store = MemoryStateStore::new();
        let addr: IpAddr = "10.8.0.2".parse().unwrap();
        assert_eq!(store.get(&addr).action, ActionKind::None);
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_putting_none_forgets_entry() {
        let mut store = MemoryStateStore::new();
        let state = blocked("10.8.0.2", "alice");
        store.put(state.clone()).unwrap();
        assert_eq!(store.all().len(), 1);

        store.put(EnforcementState::none(state.address)).unwrap();
        assert!(store.all().is_empty());
    }

    #[test]
    fn test_find_by_client() {
        let mut store = MemoryStateStore::new();
        store.put(blocked("10.8.0.2", "alice")).unwrap();
        store.put(blocked("10.8.0.3", "bob")).unwrap();

        let found = store.find_by_client("bob");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "10.8.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        {
            let mut store = JsonStateStore::open(&path).unwrap();
            store.put(blocked("10.8.0.2", "alice")).unwrap();
        }

        let store = JsonStateStore::open(&path).unwrap();
        let state = store.get(&"10.8.0.2".parse().unwrap());
        assert_eq!(state.action, ActionKind::Blocked);
        assert_eq!(state.client.as_deref(), Some("alice"));
    }

    #[test]
    fn test_json_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "[{").unwrap();

        let err = JsonStateStore::open(&path).err().unwrap();
        assert_eq!(err.kind, EnforcementErrorKind::State);
    }
}
