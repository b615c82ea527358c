pub mod consent;
pub mod gtm;
pub mod record;
pub mod trackers;

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use crate::capture::PageCapture;
use crate::config::Settings;
use crate::trackerdb::TrackerSnapshot;
use crate::urls::UrlEntry;
use crate::utils::host_within;
pub use record::{ConsentState, DetectionRecord, Finding, RecordStatus, TrackerHit};

/// Turns one page capture into a detection record.
///
/// Stateless apart from configuration; the tracker snapshot is passed per
/// call and only read.
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    google_domains: Vec<String>,
}

impl DetectionEngine {
    pub fn new(google_domains: Vec<String>) -> Self {
        Self {
            google_domains: google_domains
                .into_iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.google_domains.clone())
    }

    pub fn analyze(
        &self,
        target: &UrlEntry,
        capture: &PageCapture,
        snapshot: &TrackerSnapshot,
        attempts: u32,
    ) -> DetectionRecord {
        let started = Instant::now();

        if let Some(reason) = capture.unusable_reason() {
            debug!(url = %target.url, reason, "Degenerate capture");
            let mut record = undetermined(target, snapshot, RecordStatus::Degenerate, attempts);
            record.error = Some(reason.to_string());
            record.analysis_ms = started.elapsed().as_millis() as u64;
            return record;
        }

        let gtm = gtm::scan(capture);
        let consent = consent::classify(capture);
        let third_party = trackers::classify(capture, snapshot, &gtm);
        let google_urls = self.google_urls(capture);

        // Without a container there are no GTM events to report.
        let gtm_events = if gtm.present {
            unique_in_order(&capture.data_layer_events)
        } else {
            Vec::new()
        };

        debug!(
            url = %target.url,
            gtm = gtm.present,
            consent = %consent,
            hits = third_party.hits.len(),
            google_urls = google_urls.len(),
            "Analyzed capture"
        );

        DetectionRecord {
            url: target.url.clone(),
            rank: target.rank,
            platform: target.platform.clone(),
            status: RecordStatus::Analyzed,
            gtm_present: Finding::Known(gtm.present),
            gtm_ids: Finding::Known(gtm.container_ids),
            consent_state: Finding::Known(consent),
            tracker_hits: Finding::Known(third_party.hits),
            third_party_domains: Finding::Known(third_party.domains),
            gtm_events: Finding::Known(gtm_events),
            google_url_count: Finding::Known(google_urls.len()),
            google_urls: Finding::Known(google_urls),
            trackerdb_source: snapshot.source,
            trackerdb_patterns: snapshot.pattern_count(),
            attempts,
            analysis_ms: started.elapsed().as_millis() as u64,
            analyzed_at: Utc::now(),
            error: None,
        }
    }

    /// Record for a URL whose every render attempt failed.
    pub fn failed(
        &self,
        target: &UrlEntry,
        error: &str,
        attempts: u32,
        snapshot: &TrackerSnapshot,
    ) -> DetectionRecord {
        let mut record = undetermined(target, snapshot, RecordStatus::Failed, attempts);
        record.error = Some(error.to_string());
        record
    }

    /// Request URLs on Google-owned hosts, in request order with repeats.
    pub fn google_urls(&self, capture: &PageCapture) -> Vec<String> {
        capture
            .requests
            .iter()
            .filter(|r| self.google_domains.iter().any(|d| host_within(&r.domain, d)))
            .map(|r| r.url.clone())
            .collect()
    }
}

fn undetermined(
    target: &UrlEntry,
    snapshot: &TrackerSnapshot,
    status: RecordStatus,
    attempts: u32,
) -> DetectionRecord {
    DetectionRecord {
        url: target.url.clone(),
        rank: target.rank,
        platform: target.platform.clone(),
        status,
        gtm_present: Finding::Undetermined,
        gtm_ids: Finding::Undetermined,
        consent_state: Finding::Undetermined,
        tracker_hits: Finding::Undetermined,
        third_party_domains: Finding::Undetermined,
        gtm_events: Finding::Undetermined,
        google_url_count: Finding::Undetermined,
        google_urls: Finding::Undetermined,
        trackerdb_source: snapshot.source,
        trackerdb_patterns: snapshot.pattern_count(),
        attempts,
        analysis_ms: 0,
        analyzed_at: Utc::now(),
        error: None,
    }
}

fn unique_in_order(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|e| !e.is_empty() && seen.insert(e.as_str()))
        .cloned()
        .collect()
}
