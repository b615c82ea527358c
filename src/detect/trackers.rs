use std::collections::BTreeMap;

use super::gtm::{is_gtm_host, GtmScan};
use super::record::TrackerHit;
use crate::capture::PageCapture;
use crate::trackerdb::TrackerSnapshot;
use crate::utils::registrable_domain;

#[derive(Debug, Default)]
pub struct ThirdPartyScan {
    /// Distinct third-party request domains, sorted.
    pub domains: Vec<String>,
    /// Tracker hits across those domains, sorted by signature then domain.
    pub hits: Vec<TrackerHit>,
}

/// Match every distinct request domain outside the site's registrable domain
/// against the snapshot, and time each hit against the container load.
pub fn classify(capture: &PageCapture, snapshot: &TrackerSnapshot, gtm: &GtmScan) -> ThirdPartyScan {
    let site = capture.site_host().map(|h| registrable_domain(&h));

    // Earliest request start per third-party domain.
    let mut first_seen: BTreeMap<&str, f64> = BTreeMap::new();
    for r in &capture.requests {
        let domain = r.domain.as_str();
        if domain.is_empty() || site.as_deref() == Some(registrable_domain(domain).as_str()) {
            continue;
        }
        first_seen
            .entry(domain)
            .and_modify(|t| *t = t.min(r.started_ms))
            .or_insert(r.started_ms);
    }

    let mut hits = BTreeMap::new();
    for (&domain, &started_ms) in &first_seen {
        let delta = gtm.loaded_ms.map(|loaded| started_ms - loaded);
        let attribution = (!is_gtm_host(domain)).then(|| gtm_attribution(gtm.present, delta));
        for sig in snapshot.matches(domain) {
            hits.entry((sig.key.clone(), domain.to_string(), sig.pattern.clone()))
                .or_insert_with(|| TrackerHit {
                    signature: sig.key.clone(),
                    matched_domain: domain.to_string(),
                    pattern: sig.pattern.clone(),
                    name: sig.name.clone(),
                    category: sig.category.clone(),
                    gtm_delta_ms: delta.map(|d| d.round() as i64),
                    gtm_attribution: attribution,
                });
        }
    }

    ThirdPartyScan {
        domains: first_seen.into_keys().map(String::from).collect(),
        hits: hits.into_values().collect(),
    }
}

/// Likelihood that a request starting `delta_ms` after the container load was
/// fired by GTM. Without a load time, presence alone gives a middling score.
pub fn gtm_attribution(gtm_present: bool, delta_ms: Option<f64>) -> f64 {
    match delta_ms {
        None if gtm_present => 0.7,
        None => 0.0,
        Some(d) if d < 0.0 => 0.0,
        Some(d) if d <= 5_000.0 => 0.9,
        Some(d) if d <= 15_000.0 => 0.8,
        Some(d) if d <= 30_000.0 => 0.6,
        Some(_) => 0.3,
    }
}
