// Client name -> tunnel address resolution from the WireGuard peer config

use crate::error::ResolutionError;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// A client as seen in this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub name: String,
    pub address: IpAddr,
}

/// Snapshot of the peer configuration taken once per pass
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    contents: String,
}

impl PeerTable {
    pub fn from_contents(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    /// Names of every marked peer block, in file order
    pub fn names(&self) -> Vec<&str> {
        self.contents
            .lines()
            .filter_map(|line| peer_marker(line.trim()))
            .collect()
    }

    /// Find the first AllowedIPs address inside `name`'s block
    pub fn resolve(&self, name: &str) -> Result<ClientIdentity, ResolutionError> {
        let mut in_block = false;
        let mut sections_seen = 0u32;

        for line in self.contents.lines() {
            let line = line.trim();

            if let Some(marker) = peer_marker(line) {
                if in_block {
                    // Next peer's block starts here
                    break;
                }
                in_block = marker == name;
                sections_seen = 0;
                continue;
            }

            if !in_block {
                continue;
            }

            if line.starts_with('[') {
                sections_seen += 1;
                if sections_seen > 1 {
                    break;
                }
                continue;
            }

            if let Some(value) = allowed_ips_value(line) {
                let address = parse_allowed_ip(value).ok_or_else(|| {
                    ResolutionError::InvalidAddress {
                        name: name.to_string(),
                        value: value.to_string(),
                    }
                })?;
                return Ok(ClientIdentity {
                    name: name.to_string(),
                    address,
                });
            }
        }

        Err(ResolutionError::NotFound(name.to_string()))
    }
}

/// Reads the peer configuration file
pub struct IdentityResolver {
    path: PathBuf,
}

impl IdentityResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the peer config fresh. Addresses are never carried between passes.
    pub async fn snapshot(&self) -> Result<PeerTable, ResolutionError> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ResolutionError::PeerConfig {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
        Ok(PeerTable::from_contents(contents))
    }

    /// One-off lookup against a fresh snapshot
    pub async fn resolve(&self, name: &str) -> Result<ClientIdentity, ResolutionError> {
        self.snapshot().await?.resolve(name)
    }
}

/// Peer name from a marker comment: `### alice` or `# Client: alice (id)`
fn peer_marker(line: &str) -> Option<&str> {
    if !line.starts_with('#') {
        return None;
    }
    let text = line.trim_start_matches('#').trim();

    if let Some(rest) = text.strip_prefix("Client:") {
        let rest = rest.trim();
        let name = match rest.rfind(" (") {
            Some(idx) if rest.ends_with(')') => &rest[..idx],
            _ => rest,
        };
        return Some(name.trim());
    }

    // Plain comments inside a [Peer] section are not markers
    if line.starts_with("###") && !text.is_empty() {
        return Some(text);
    }

    None
}

fn allowed_ips_value(line: &str) -> Option<&str> {
    let (key, value) = line.split_once('=')?;
    if key.trim().eq_ignore_ascii_case("AllowedIPs") {
        Some(value.trim())
    } else {
        None
    }
}

fn parse_allowed_ip(value: &str) -> Option<IpAddr> {
    let first = value.split(',').next()?.trim();
    let ip = first.split('/').next()?.trim();
    ip.parse().ok()
}
