use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::capture::{CapturedCookie, CapturedRequest, PageCapture};
use crate::config::Settings;
use crate::error::CaptureError;

/// How the renderer should drive a page before capturing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionProfile {
    pub page_load_timeout: Duration,
    pub interaction_timeout: Duration,
    /// Quiet period after interaction so late tags can fire.
    pub settle: Duration,
    pub scroll: bool,
    pub accept_consent: bool,
}

impl InteractionProfile {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            page_load_timeout: settings.page_load_timeout(),
            interaction_timeout: settings.interaction_timeout(),
            settle: Duration::from_millis(settings.settle_ms),
            scroll: true,
            accept_consent: true,
        }
    }

    /// Upper bound for one whole navigate call.
    pub fn deadline(&self) -> Duration {
        self.page_load_timeout + self.interaction_timeout + self.settle + Duration::from_secs(5)
    }
}

/// The page-rendering collaborator.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn navigate(
        &self,
        url: &str,
        profile: &InteractionProfile,
    ) -> Result<PageCapture, CaptureError>;
}

// Runs inside the Browserless browser. Records every request from navigation
// start, clicks the first visible consent button, scrolls, waits, and returns
// the page state as JSON.
const CAPTURE_FUNCTION: &str = r#"
export default async function ({ page, context }) {
  const requests = [];
  const t0 = Date.now();
  page.on('request', (req) => {
    requests.push({ url: req.url(), started_ms: Date.now() - t0, resource_type: req.resourceType() });
  });
  const sleep = (ms) => new Promise((r) => setTimeout(r, ms));

  await page.goto(context.url, { waitUntil: 'load', timeout: context.pageLoadTimeoutMs });

  if (context.acceptConsent) {
    const labels = ['accept all', 'accept', 'agree', 'allow', 'ok', 'got it', 'continue', 'essential'];
    try {
      await page.evaluate((labels) => {
        const buttons = Array.from(document.querySelectorAll('button, [role="button"], a'));
        const visible = (el) => !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
        for (const label of labels) {
          const hit = buttons.find((b) => visible(b) && (b.innerText || '').trim().toLowerCase() === label);
          if (hit) { hit.click(); return true; }
        }
        const fallback = document.querySelector('[id*="accept"], [class*="accept"], [id*="consent"] button');
        if (fallback && visible(fallback)) { fallback.click(); return true; }
        return false;
      }, labels);
      await sleep(1000);
    } catch (e) {}
  }

  if (context.scroll) {
    try {
      await page.evaluate(() => window.scrollTo(0, document.body.scrollHeight / 2));
      await sleep(Math.min(2000, context.interactionTimeoutMs));
    } catch (e) {}
  }

  await sleep(context.settleMs);

  const dom = await page.evaluate(() => ({
    html: document.documentElement ? document.documentElement.outerHTML : '',
    scripts: Array.from(document.querySelectorAll('script:not([src])')).map((s) => s.textContent || ''),
    events: Array.isArray(window.dataLayer)
      ? window.dataLayer.map((e) => e && e.event).filter((e) => typeof e === 'string')
      : [],
  }));
  const cookies = (await page.cookies()).map((c) => ({ name: c.name, domain: c.domain }));

  return {
    data: {
      final_url: page.url(),
      html: dom.html,
      scripts: dom.scripts,
      requests,
      cookies,
      data_layer_events: dom.events,
    },
    type: 'application/json',
  };
}
"#;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CaptureResponse {
    final_url: Option<String>,
    html: String,
    scripts: Vec<String>,
    requests: Vec<RawRequest>,
    cookies: Vec<CapturedCookie>,
    data_layer_events: Vec<String>,
}

impl Default for CaptureResponse {
    fn default() -> Self {
        Self {
            final_url: None,
            html: String::new(),
            scripts: Vec::new(),
            requests: Vec::new(),
            cookies: Vec::new(),
            data_layer_events: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    url: String,
    #[serde(default)]
    started_ms: f64,
    resource_type: Option<String>,
}

impl CaptureResponse {
    fn into_capture(self, requested_url: &str) -> PageCapture {
        PageCapture {
            requested_url: requested_url.to_string(),
            final_url: self.final_url.unwrap_or_else(|| requested_url.to_string()),
            html: self.html,
            scripts: self.scripts,
            requests: self
                .requests
                .into_iter()
                .map(|r| CapturedRequest::new(&r.url, r.started_ms, r.resource_type))
                .collect(),
            cookies: self.cookies,
            data_layer_events: self.data_layer_events,
        }
    }
}

/// Renders pages through a Browserless `/function` endpoint.
pub struct BrowserlessRenderer {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessRenderer {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CaptureError::Navigation(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, CaptureError> {
        Self::new(&settings.browserless_url, settings.browserless_token.as_deref())
    }

    fn endpoint(&self, profile: &InteractionProfile) -> String {
        let mut endpoint = format!(
            "{}/function?timeout={}",
            self.base_url,
            profile.deadline().as_millis()
        );
        if let Some(token) = &self.token {
            endpoint.push_str(&format!("&token={token}"));
        }
        endpoint
    }

    async fn navigate_inner(
        &self,
        url: &str,
        profile: &InteractionProfile,
    ) -> Result<PageCapture, CaptureError> {
        let body = json!({
            "code": CAPTURE_FUNCTION,
            "context": {
                "url": url,
                "pageLoadTimeoutMs": profile.page_load_timeout.as_millis() as u64,
                "interactionTimeoutMs": profile.interaction_timeout.as_millis() as u64,
                "settleMs": profile.settle.as_millis() as u64,
                "scroll": profile.scroll,
                "acceptConsent": profile.accept_consent,
            }
        });

        let resp = self
            .client
            .post(self.endpoint(profile))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 408 || status.as_u16() == 504 {
            return Err(CaptureError::Timeout(profile.page_load_timeout));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(CaptureError::Navigation(format!(
                "browserless returned {}: {}",
                status.as_u16(),
                message.chars().take(200).collect::<String>()
            )));
        }

        let raw = resp.bytes().await?;
        let parsed: CaptureResponse =
            serde_json::from_slice(&raw).map_err(|e| CaptureError::Malformed(e.to_string()))?;
        debug!(
            url,
            requests = parsed.requests.len(),
            html_bytes = parsed.html.len(),
            "Captured page"
        );
        Ok(parsed.into_capture(url))
    }
}

#[async_trait]
impl Renderer for BrowserlessRenderer {
    async fn navigate(
        &self,
        url: &str,
        profile: &InteractionProfile,
    ) -> Result<PageCapture, CaptureError> {
        let deadline = profile.deadline();
        match tokio::time::timeout(deadline, self.navigate_inner(url, profile)).await {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(deadline)),
        }
    }
}
