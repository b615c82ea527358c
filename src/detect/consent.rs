use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use super::record::ConsentState;
use crate::capture::PageCapture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Evidence {
    /// DOM and inline script text.
    Text,
    /// Outgoing request URLs.
    Request,
}

struct ConsentRule {
    state: ConsentState,
    evidence: Evidence,
    label: &'static str,
    pattern: Regex,
}

fn rule(state: ConsentState, evidence: Evidence, label: &'static str, pattern: &str) -> ConsentRule {
    ConsentRule {
        state,
        evidence,
        label,
        pattern: Regex::new(pattern).unwrap(),
    }
}

// `gcd` encodes one letter per consent type: r/n/v = granted by an update,
// m/q/u = denied by an update, p/t = set by default only.
static RULES: LazyLock<Vec<ConsentRule>> = LazyLock::new(|| {
    use ConsentState::*;
    use Evidence::*;
    vec![
        rule(
            GrantedExplicit,
            Text,
            "update call granting storage",
            r#"(?i)['"]consent['"]\s*,\s*['"]update['"]\s*,\s*\{[^}]*:\s*['"]granted['"]"#,
        ),
        rule(GrantedExplicit, Request, "gcd granted by update", r"[?&]gcd=[0-9a-z]*[rnv]"),
        rule(
            DeniedExplicit,
            Text,
            "update call denying storage",
            r#"(?i)['"]consent['"]\s*,\s*['"]update['"]\s*,\s*\{[^}]*:\s*['"]denied['"]"#,
        ),
        rule(DeniedExplicit, Request, "gcd denied by update", r"[?&]gcd=[0-9a-z]*[mqu]"),
        rule(
            Updated,
            Text,
            "generic update call",
            r#"(?i)['"]consent['"]\s*,\s*['"]update['"]"#,
        ),
        rule(
            DefaultOnly,
            Text,
            "default call",
            r#"(?i)['"]consent['"]\s*,\s*['"]default['"]"#,
        ),
        rule(DefaultOnly, Request, "consent parameters on google hit", r"(?i)[?&](?:gcs=g1|gcd=)"),
    ]
});

/// Classify the page's consent-mode state.
///
/// Rules are ordered by precedence; the first rule with any matching
/// evidence decides the state and lower rules are not consulted.
pub fn classify(capture: &PageCapture) -> ConsentState {
    for rule in RULES.iter() {
        let hit = match rule.evidence {
            Evidence::Text => capture.text_fragments().any(|t| rule.pattern.is_match(t)),
            Evidence::Request => capture.requests.iter().any(|r| rule.pattern.is_match(&r.url)),
        };
        if hit {
            debug!(rule = rule.label, state = %rule.state, "Consent rule matched");
            return rule.state;
        }
    }
    ConsentState::NotDetected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CapturedRequest;

    const DEFAULT_CALL: &str = "gtag('consent', 'default', { 'ad_storage': 'denied', 'analytics_storage': 'denied' });";
    const GRANT_CALL: &str = "gtag('consent', 'update', { 'ad_storage': 'granted', 'analytics_storage': 'granted' });";
    const DENY_CALL: &str = "gtag(\"consent\", \"update\", {ad_storage: \"denied\"});";

    fn with_scripts(scripts: &[&str]) -> PageCapture {
        PageCapture {
            scripts: scripts.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn with_requests(urls: &[&str]) -> PageCapture {
        PageCapture {
            requests: urls.iter().map(|u| CapturedRequest::new(u, 0.0, None)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn rules_are_in_precedence_order() {
        let states: Vec<_> = RULES.iter().map(|r| r.state).collect();
        let mut sorted = states.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(states, sorted);
    }

    #[test]
    fn default_only() {
        assert_eq!(classify(&with_scripts(&[DEFAULT_CALL])), ConsentState::DefaultOnly);
    }

    #[test]
    fn explicit_grant_overrides_default() {
        let capture = with_scripts(&[DEFAULT_CALL, GRANT_CALL]);
        assert_eq!(classify(&capture), ConsentState::GrantedExplicit);
    }

    #[test]
    fn explicit_deny() {
        let capture = with_scripts(&[DEFAULT_CALL, DENY_CALL]);
        assert_eq!(classify(&capture), ConsentState::DeniedExplicit);
    }

    #[test]
    fn generic_update_without_values() {
        let capture = with_scripts(&[DEFAULT_CALL, "dataLayer.push(['consent','update', consentFromCmp()]);"]);
        assert_eq!(classify(&capture), ConsentState::Updated);
    }

    #[test]
    fn gcd_parameter_carries_update_state() {
        let granted = with_requests(&["https://region1.google-analytics.com/g/collect?v=2&gcs=G111&gcd=13r3r3r2r5l1"]);
        assert_eq!(classify(&granted), ConsentState::GrantedExplicit);

        let denied = with_requests(&["https://www.google-analytics.com/g/collect?gcd=13q3q3q2q5l1&v=2"]);
        assert_eq!(classify(&denied), ConsentState::DeniedExplicit);

        let default = with_requests(&["https://www.google-analytics.com/g/collect?gcd=13p3p3p2p5l1"]);
        assert_eq!(classify(&default), ConsentState::DefaultOnly);
    }

    #[test]
    fn nothing_found() {
        let capture = PageCapture {
            html: "<html><body>consent banner text only</body></html>".into(),
            requests: vec![CapturedRequest::new("https://shop.example/cart?gclid=abc", 0.0, None)],
            ..Default::default()
        };
        assert_eq!(classify(&capture), ConsentState::NotDetected);
    }

    #[test]
    fn fixture_page_is_granted() {
        let html = std::fs::read_to_string("tests/fixtures/gtm_consent_update.html").unwrap();
        let capture = PageCapture {
            html,
            ..Default::default()
        };
        assert_eq!(classify(&capture), ConsentState::GrantedExplicit);
    }
}
