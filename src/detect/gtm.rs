use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::capture::PageCapture;
use crate::utils::host_within;

static LOADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)googletagmanager\.com/(?:gtm\.js|gtag/js|ns\.html)|['"]gtm\.start['"]"#).unwrap()
});
static CONTAINER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i-u)\bGTM-[A-Z0-9]{4,12}\b").unwrap());

const GTM_HOST: &str = "googletagmanager.com";
const LOADER_PATHS: &[&str] = &["/gtm.js", "/gtag/js", "/ns.html"];

#[derive(Debug, Clone, PartialEq)]
pub struct GtmScan {
    pub present: bool,
    pub container_ids: Vec<String>,
    /// Start of the first `gtm.js` request, in ms since navigation start.
    pub loaded_ms: Option<f64>,
}

pub fn scan(capture: &PageCapture) -> GtmScan {
    let loader_in_text = capture.text_fragments().any(|t| LOADER_RE.is_match(t));
    let loader_requested = capture.requests.iter().any(|r| {
        is_gtm_host(&r.domain) && LOADER_PATHS.iter().any(|p| r.path.starts_with(p))
    });

    let sources = capture
        .text_fragments()
        .chain(capture.requests.iter().map(|r| r.url.as_str()));
    let container_ids = extract_container_ids(sources);

    GtmScan {
        present: loader_in_text || loader_requested || !container_ids.is_empty(),
        container_ids,
        loaded_ms: loader_started_ms(capture),
    }
}

/// When the container script was first requested.
pub fn loader_started_ms(capture: &PageCapture) -> Option<f64> {
    capture
        .requests
        .iter()
        .filter(|r| is_gtm_host(&r.domain) && r.path.starts_with("/gtm.js"))
        .map(|r| r.started_ms)
        .reduce(f64::min)
}

pub fn is_gtm_host(domain: &str) -> bool {
    host_within(domain, GTM_HOST)
}

/// Container ids across `sources`, uppercased, deduplicated case-insensitively,
/// in first-seen order.
///
/// A candidate must not continue with `-`. Lowercase candidates made only of
/// letters count only as a loader `id=` parameter, which keeps CSS hooks like
/// `gtm-banner` out.
pub fn extract_container_ids<'a>(sources: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();

    for text in sources {
        for m in CONTAINER_RE.find_iter(text) {
            if text[m.end()..].starts_with('-') {
                continue;
            }
            if !looks_like_container(m.as_str(), &text[..m.start()]) {
                continue;
            }
            let id = m.as_str().to_ascii_uppercase();
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }
    ids
}

fn looks_like_container(candidate: &str, before: &str) -> bool {
    let body = &candidate[4..];
    let uppercase = candidate.starts_with("GTM-") && !body.bytes().any(|b| b.is_ascii_lowercase());
    let before = before.as_bytes();
    let loader_param =
        before.len() >= 3 && before[before.len() - 3..].eq_ignore_ascii_case(b"id=");
    uppercase || loader_param || body.bytes().any(|b| b.is_ascii_digit())
}
