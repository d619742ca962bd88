// Release requests handed from the CLI to the running loop
//
// The loop is the only writer of enforcement state, so a manual release is
// queued as a file and applied by the loop before its next pass.

use crate::error::RequestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// Tunnel address or client name
    pub target: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseTarget {
    Address(IpAddr),
    Client(String),
}

impl ReleaseRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into().trim().to_string(),
            requested_at: Utc::now(),
        }
    }

    pub fn target(&self) -> ReleaseTarget {
        match self.target.parse::<IpAddr>() {
            Ok(address) => ReleaseTarget::Address(address),
            Err(_) => ReleaseTarget::Client(self.target.clone()),
        }
    }
}

/// Directory of pending requests, one JSON file each, applied in name order
pub struct RequestQueue {
    dir: PathBuf,
}

impl RequestQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue a release of `target`, returning the request file
    pub fn submit(&self, target: &str) -> Result<PathBuf, RequestError> {
        let request = ReleaseRequest::new(target);
        let contents = serde_json::to_string_pretty(&request)?;

        let io_error = |source| RequestError::Io {
            path: self.dir.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_error)?;

        let stamp = request.requested_at.timestamp_nanos_opt().unwrap_or_default();
        let path = self
            .dir
            .join(format!("{:020}-{}.json", stamp, std::process::id()));

        // Readers only pick up *.json, so the rename publishes a complete file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(io_error)?;

        Ok(path)
    }

    /// Pending requests, oldest first. Unreadable files are dropped.
    pub fn pending(&self) -> Vec<(PathBuf, ReleaseRequest)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Cannot read release requests in {:?}: {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut requests = Vec::new();
        for path in paths {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|contents| {
                    serde_json::from_str::<ReleaseRequest>(&contents).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(request) => requests.push((path, request)),
                Err(e) => {
                    log::warn!("Dropping release request {:?}: {}", path, e);
                    self.complete(&path);
                }
            }
        }
        requests
    }

    /// Forget a request once it has been applied
    pub fn complete(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != ErrorKind::NotFound {
                log::warn!("Failed to remove release request {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_submitted_requests_come_back_in_order() {
        let dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(dir.path().join("requests"));

        queue.submit("alice").unwrap();
        queue.submit(" 10.8.0.3 ").unwrap();

        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1.target(), ReleaseTarget::Client("alice".to_string()));
        assert_eq!(
            pending[1].1.target(),
            ReleaseTarget::Address("10.8.0.3".parse().unwrap())
        );

        queue.complete(&pending[0].0);
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(dir.path().join("absent"));
        assert!(queue.pending().is_empty());
    }

    #[test]
    fn test_corrupt_request_is_dropped() {
        let dir = TempDir::new().unwrap();
        let queue = RequestQueue::new(dir.path());
        fs::write(dir.path().join("0001.json"), "{ nope").unwrap();
        fs::write(dir.path().join("0002.json.tmp"), "partial").unwrap();

        assert!(queue.pending().is_empty());
        assert!(!dir.path().join("0001.json").exists());
        // In-flight writes are left alone
        assert!(dir.path().join("0002.json.tmp").exists());
    }
}
