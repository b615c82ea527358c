use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A known tracker domain. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackerSignature {
    /// Lowercased domain pattern, matched as a suffix on label boundaries.
    pub pattern: String,
    /// TrackerDB pattern key, e.g. `google_analytics`.
    pub key: String,
    pub name: String,
    pub category: String,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Remote,
    Cache,
    Fallback,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotSource::Remote => "remote",
            SnapshotSource::Cache => "cache",
            SnapshotSource::Fallback => "fallback",
        })
    }
}

/// The one signature set active for a run.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    signatures: Vec<TrackerSignature>,
    index: HashMap<String, Vec<usize>>,
    pub fetched_at: DateTime<Utc>,
    pub source: SnapshotSource,
    pub release: Option<String>,
    /// Set when the snapshot came from a stale cache or the fallback bundle.
    pub degraded: bool,
}

impl TrackerSnapshot {
    pub fn new(
        mut signatures: Vec<TrackerSignature>,
        fetched_at: DateTime<Utc>,
        source: SnapshotSource,
        release: Option<String>,
        degraded: bool,
    ) -> Self {
        signatures.sort();
        signatures.dedup();

        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, sig) in signatures.iter().enumerate() {
            index.entry(sig.pattern.clone()).or_default().push(i);
        }

        Self {
            signatures,
            index,
            fetched_at,
            source,
            release,
            degraded,
        }
    }

    pub fn empty(source: SnapshotSource, fetched_at: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), fetched_at, source, None, true)
    }

    pub fn signatures(&self) -> &[TrackerSignature] {
        &self.signatures
    }

    /// Number of distinct TrackerDB patterns (keys).
    pub fn pattern_count(&self) -> usize {
        self.signatures
            .iter()
            .map(|s| s.key.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn domain_count(&self) -> usize {
        self.index.len()
    }

    /// Signatures whose pattern is the longest suffix of `domain`.
    ///
    /// `cdn.stats.example.com` is tried as-is, then `stats.example.com`, then
    /// `example.com`; the first level with any pattern wins. Single-label
    /// suffixes are never matched.
    pub fn matches(&self, domain: &str) -> Vec<&TrackerSignature> {
        let host = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        let mut candidate = host.as_str();

        while candidate.contains('.') {
            if let Some(ids) = self.index.get(candidate) {
                return ids.iter().map(|&i| &self.signatures[i]).collect();
            }
            match candidate.split_once('.') {
                Some((_, rest)) => candidate = rest,
                None => break,
            }
        }
        Vec::new()
    }
}

/// Parse a TrackerDB export into signatures.
///
/// Accepts `{"patterns": {..}}`, `{"trackers": {..}}` or a bare key→entry map.
pub fn parse_trackerdb(data: &Value) -> Result<Vec<TrackerSignature>, String> {
    let patterns = data
        .get("patterns")
        .or_else(|| data.get("trackers"))
        .unwrap_or(data)
        .as_object()
        .ok_or_else(|| "trackerdb payload is not an object".to_string())?;

    let organizations = data.get("organizations").and_then(Value::as_object);

    let mut signatures = Vec::new();
    for (key, entry) in patterns {
        let Some(entry) = entry.as_object() else {
            continue;
        };

        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(key)
            .to_string();
        let category = entry
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        // Organization is either an inline name or a key into `organizations`.
        let organization = entry.get("organization").and_then(Value::as_str).map(|org| {
            organizations
                .and_then(|orgs| orgs.get(org))
                .and_then(|o| o.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(org)
                .to_string()
        });

        let domains: Vec<&str> = match entry.get("domains") {
            Some(Value::String(d)) => vec![d.as_str()],
            Some(Value::Array(list)) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };

        for domain in domains {
            let pattern = domain.trim().trim_end_matches('.').to_ascii_lowercase();
            if pattern.is_empty() {
                continue;
            }
            signatures.push(TrackerSignature {
                pattern,
                key: key.clone(),
                name: name.clone(),
                category: category.clone(),
                organization: organization.clone(),
            });
        }
    }

    Ok(signatures)
}
