use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

const DEFAULT_RELEASES_URL: &str = "https://api.github.com/repos/ghostery/trackerdb/releases/latest";

/// Runtime settings: defaults, then `gtm_scanner.toml`, then `GTM_*` env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base for the relative data paths below.
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub url_list: PathBuf,

    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,

    pub page_load_timeout_secs: u64,
    pub interaction_timeout_secs: u64,
    pub settle_ms: u64,

    pub trackerdb_fetch_timeout_secs: u64,
    pub trackerdb_releases_url: String,
    pub trackerdb_cache_path: PathBuf,
    pub trackerdb_fallback_paths: Vec<PathBuf>,
    pub trackerdb_freshness_hours: i64,
    pub trackerdb_expiry_days: i64,

    pub browserless_url: String,
    pub browserless_token: Option<String>,

    /// Google-owned request domains counted into `google_url_count`.
    pub google_domains: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("output"),
            url_list: PathBuf::from("urls.csv"),
            batch_size: 100,
            max_attempts: 3,
            retry_backoff_ms: 2000,
            page_load_timeout_secs: 45,
            interaction_timeout_secs: 20,
            settle_ms: 3000,
            trackerdb_fetch_timeout_secs: 30,
            trackerdb_releases_url: DEFAULT_RELEASES_URL.to_string(),
            trackerdb_cache_path: PathBuf::from("trackerdb/cached_trackerdb.json"),
            trackerdb_fallback_paths: vec![
                PathBuf::from("fallback/trackerdb.json"),
                PathBuf::from("trackerdb.json"),
            ],
            trackerdb_freshness_hours: 24,
            trackerdb_expiry_days: 7,
            browserless_url: "http://localhost:3000".to_string(),
            browserless_token: None,
            google_domains: default_google_domains(),
        }
    }
}

fn default_google_domains() -> Vec<String> {
    [
        "googletagmanager.com",
        "google-analytics.com",
        "analytics.google.com",
        "googletagservices.com",
        "doubleclick.net",
        "googleadservices.com",
        "googlesyndication.com",
    ]
    .iter()
    .map(|d| d.to_string())
    .collect()
}

impl Settings {
    pub fn load() -> Result<Self> {
        let built = Config::builder()
            .add_source(File::with_name("gtm_scanner").required(false))
            .add_source(
                Environment::with_prefix("GTM")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("google_domains")
                    .with_list_parse_key("trackerdb_fallback_paths"),
            )
            .build()
            .context("Failed to read configuration")?;
        built
            .try_deserialize()
            .context("Invalid configuration values")
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn interaction_timeout(&self) -> Duration {
        Duration::from_secs(self.interaction_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.trackerdb_fetch_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn session_dir(&self, session: &str) -> PathBuf {
        self.output_dir.join(session)
    }

    /// Absolute paths pass through unchanged.
    fn in_data_dir(&self, path: &Path) -> PathBuf {
        self.data_dir.join(path)
    }

    pub fn url_list_path(&self) -> PathBuf {
        self.in_data_dir(&self.url_list)
    }

    pub fn trackerdb_cache(&self) -> PathBuf {
        self.in_data_dir(&self.trackerdb_cache_path)
    }

    pub fn trackerdb_fallbacks(&self) -> Vec<PathBuf> {
        self.trackerdb_fallback_paths
            .iter()
            .map(|p| self.in_data_dir(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let s = Settings::default();
        assert_eq!(s.batch_size, 100);
        assert_eq!(s.trackerdb_freshness_hours, 24);
        assert_eq!(s.trackerdb_expiry_days, 7);
        assert!(s.google_domains.iter().any(|d| d == "googletagmanager.com"));
    }

    #[test]
    fn timeouts_are_independent() {
        let s = Settings {
            page_load_timeout_secs: 10,
            interaction_timeout_secs: 4,
            trackerdb_fetch_timeout_secs: 2,
            ..Settings::default()
        };
        assert_eq!(s.page_load_timeout(), Duration::from_secs(10));
        assert_eq!(s.interaction_timeout(), Duration::from_secs(4));
        assert_eq!(s.fetch_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn data_paths_resolve_under_data_dir() {
        let s = Settings {
            data_dir: PathBuf::from("/srv/gtm"),
            trackerdb_fallback_paths: vec![
                PathBuf::from("fallback/trackerdb.json"),
                PathBuf::from("/opt/trackerdb.json"),
            ],
            ..Settings::default()
        };
        assert_eq!(s.url_list_path(), PathBuf::from("/srv/gtm/urls.csv"));
        assert_eq!(
            s.trackerdb_cache(),
            PathBuf::from("/srv/gtm/trackerdb/cached_trackerdb.json")
        );
        assert_eq!(
            s.trackerdb_fallbacks(),
            vec![
                PathBuf::from("/srv/gtm/fallback/trackerdb.json"),
                PathBuf::from("/opt/trackerdb.json"),
            ]
        );
    }
}
