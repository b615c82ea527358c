use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::trackerdb::SnapshotSource;

const UNDETERMINED: &str = "undetermined";

/// A detection field that is either known or could not be determined.
///
/// Serialized as the bare value, or the string `"undetermined"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding<T> {
    Known(T),
    Undetermined,
}

impl<T> Finding<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Finding::Known(v) => Some(v),
            Finding::Undetermined => None,
        }
    }

    pub fn is_undetermined(&self) -> bool {
        matches!(self, Finding::Undetermined)
    }
}

impl<T: Serialize> Serialize for Finding<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Finding::Known(v) => v.serialize(serializer),
            Finding::Undetermined => serializer.serialize_str(UNDETERMINED),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Finding<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            Known(T),
            Marker(String),
        }

        match Repr::<T>::deserialize(deserializer)? {
            Repr::Known(v) => Ok(Finding::Known(v)),
            Repr::Marker(s) if s == UNDETERMINED => Ok(Finding::Undetermined),
            Repr::Marker(s) => Err(serde::de::Error::custom(format!(
                "expected a value or \"{UNDETERMINED}\", got {s:?}"
            ))),
        }
    }
}

/// Terminal consent-mode classification, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    NotDetected,
    DefaultOnly,
    Updated,
    DeniedExplicit,
    GrantedExplicit,
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConsentState::NotDetected => "not_detected",
            ConsentState::DefaultOnly => "default_only",
            ConsentState::Updated => "updated",
            ConsentState::DeniedExplicit => "denied_explicit",
            ConsentState::GrantedExplicit => "granted_explicit",
        })
    }
}

/// A request domain matched to a tracker signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerHit {
    /// TrackerDB pattern key.
    pub signature: String,
    pub matched_domain: String,
    pub pattern: String,
    pub name: String,
    pub category: String,
    /// First request to `matched_domain` minus the first `gtm.js` request, in ms.
    pub gtm_delta_ms: Option<i64>,
    /// Likelihood in `[0, 1]` that GTM fired the request. `None` for GTM's own hosts.
    pub gtm_attribution: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Analyzed,
    /// The page rendered but its capture could not support a verdict.
    Degenerate,
    /// Every render attempt failed.
    Failed,
}

/// One row of output per processed URL. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub url: String,
    pub rank: u64,
    pub platform: Option<String>,
    pub status: RecordStatus,
    pub gtm_present: Finding<bool>,
    /// Uppercase, deduplicated, first-seen order.
    pub gtm_ids: Finding<Vec<String>>,
    pub consent_state: Finding<ConsentState>,
    /// Sorted, deduplicated.
    pub tracker_hits: Finding<Vec<TrackerHit>>,
    pub third_party_domains: Finding<Vec<String>>,
    pub gtm_events: Finding<Vec<String>>,
    pub google_url_count: Finding<usize>,
    /// Requests to Google-owned hosts, in request order with repeats.
    pub google_urls: Finding<Vec<String>>,
    pub trackerdb_source: SnapshotSource,
    pub trackerdb_patterns: usize,
    pub attempts: u32,
    pub analysis_ms: u64,
    pub analyzed_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undetermined_serializes_as_marker_string() {
        let f: Finding<bool> = Finding::Undetermined;
        assert_eq!(serde_json::to_string(&f).unwrap(), "\"undetermined\"");
        assert_eq!(serde_json::to_string(&Finding::Known(false)).unwrap(), "false");
    }

    #[test]
    fn finding_reads_back_known_and_undetermined() {
        let f: Finding<ConsentState> = serde_json::from_str("\"default_only\"").unwrap();
        assert_eq!(f, Finding::Known(ConsentState::DefaultOnly));

        let f: Finding<Vec<String>> = serde_json::from_str("\"undetermined\"").unwrap();
        assert!(f.is_undetermined());

        assert!(serde_json::from_str::<Finding<bool>>("\"maybe\"").is_err());
    }

    #[test]
    fn consent_precedence_follows_ordering() {
        assert!(ConsentState::GrantedExplicit > ConsentState::Updated);
        assert!(ConsentState::DeniedExplicit > ConsentState::Updated);
        assert!(ConsentState::Updated > ConsentState::DefaultOnly);
        assert!(ConsentState::DefaultOnly > ConsentState::NotDetected);
    }
}
