use serde::{Deserialize, Serialize};
use url::Url;

/// One outgoing request observed while the page was rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub url: String,
    /// Lowercased host, empty when the URL has none (data:, blob:).
    pub domain: String,
    pub path: String,
    /// Milliseconds since navigation start.
    pub started_ms: f64,
    pub resource_type: Option<String>,
}

impl CapturedRequest {
    pub fn new(url: &str, started_ms: f64, resource_type: Option<String>) -> Self {
        let (domain, path) = match Url::parse(url) {
            Ok(parsed) => (
                parsed.host_str().unwrap_or("").to_ascii_lowercase(),
                parsed.path().to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        };
        Self {
            url: url.to_string(),
            domain,
            path,
            started_ms,
            resource_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedCookie {
    pub name: String,
    pub domain: String,
}

/// Everything the renderer saw for one URL attempt. Not mutated after capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageCapture {
    pub requested_url: String,
    /// URL after redirects.
    pub final_url: String,
    pub html: String,
    /// Inline script bodies, in document order.
    pub scripts: Vec<String>,
    /// Request log, in the order the browser issued them.
    pub requests: Vec<CapturedRequest>,
    pub cookies: Vec<CapturedCookie>,
    pub data_layer_events: Vec<String>,
}

impl PageCapture {
    /// DOM and script text, in the order detection scans it.
    pub fn text_fragments(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.html.as_str())
            .chain(self.scripts.iter().map(String::as_str))
            .filter(|t| !t.is_empty())
    }

    /// Why this capture cannot support a detection verdict, if it cannot.
    pub fn unusable_reason(&self) -> Option<&'static str> {
        let no_text = self.html.trim().is_empty() && self.scripts.iter().all(|s| s.trim().is_empty());
        match (no_text, self.requests.is_empty()) {
            (true, true) => Some("empty capture: no DOM and no network log"),
            (true, false) => Some("empty DOM"),
            (false, true) => Some("empty network log"),
            (false, false) => None,
        }
    }

    /// The page's own host, taken from the final URL when the renderer reported one.
    pub fn site_host(&self) -> Option<String> {
        let url = if self.final_url.is_empty() {
            &self.requested_url
        } else {
            &self.final_url
        };
        Url::parse(url)
            .ok()?
            .host_str()
            .map(|h| h.to_ascii_lowercase())
    }
}
