use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::snapshot::{SnapshotSource, TrackerSignature, TrackerSnapshot};
use crate::error::PersistenceError;
use crate::utils::write_atomic;

/// On-disk cache envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub release: Option<String>,
    pub signatures: Vec<TrackerSignature>,
}

impl CachedSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.fetched_at
    }

    pub fn into_snapshot(self, degraded: bool) -> TrackerSnapshot {
        TrackerSnapshot::new(
            self.signatures,
            self.fetched_at,
            SnapshotSource::Cache,
            self.release,
            degraded,
        )
    }
}

pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached snapshot. A missing or unreadable cache reads as `None`.
    pub fn read(&self) -> Option<CachedSnapshot> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "Cannot read trackerdb cache: {}", e);
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(cached) => Some(cached),
            Err(e) => {
                warn!(path = %self.path.display(), "Ignoring corrupt trackerdb cache: {}", e);
                None
            }
        }
    }

    pub fn write(&self, snapshot: &TrackerSnapshot) -> Result<(), PersistenceError> {
        let envelope = CachedSnapshot {
            fetched_at: snapshot.fetched_at,
            release: snapshot.release.clone(),
            signatures: snapshot.signatures().to_vec(),
        };
        let bytes = serde_json::to_vec(&envelope)?;
        write_atomic(&self.path, &bytes)?;
        debug!(path = %self.path.display(), "Trackerdb cache written");
        Ok(())
    }

    /// Delete the cache when it is at least `expiry` old, or dated in the
    /// future. Returns true when a file was removed.
    pub fn purge_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        let Some(cached) = self.read() else {
            return false;
        };
        let age = cached.age(now);
        let future_dated = age < Duration::zero();
        if !future_dated && age < expiry {
            return false;
        }
        match fs::remove_file(&self.path) {
            Ok(()) if future_dated => {
                warn!(
                    fetched_at = %cached.fetched_at.to_rfc3339(),
                    "Deleted future-dated trackerdb cache"
                );
                true
            }
            Ok(()) => {
                info!(
                    age_days = format!("{:.1}", age.num_minutes() as f64 / 1440.0),
                    "Deleted expired trackerdb cache"
                );
                true
            }
            Err(e) => {
                warn!("Failed to delete expired trackerdb cache: {}", e);
                false
            }
        }
    }
}
