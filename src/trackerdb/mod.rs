pub mod cache;
pub mod remote;
pub mod snapshot;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::FetchError;
use cache::SnapshotCache;
use remote::{GithubReleaseFetcher, SnapshotFetcher};
pub use snapshot::{SnapshotSource, TrackerSignature, TrackerSnapshot};

/// Loading status, echoed into every detection record.
#[derive(Debug, Clone)]
pub struct TrackerDbStatus {
    pub source: SnapshotSource,
    pub pattern_count: usize,
    pub domain_count: usize,
    pub degraded: bool,
    pub release: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Owns the active tracker snapshot and the policy that picks it.
///
/// Priority: fresh cache (younger than `freshness`, no network), remote fetch
/// (written through to the cache), stale cache (younger than `expiry`,
/// degraded), bundled fallback (degraded). Caches at or past `expiry` are
/// deleted before the chain runs.
pub struct TrackerDatabase {
    cache: SnapshotCache,
    fetcher: Box<dyn SnapshotFetcher>,
    fallback_paths: Vec<PathBuf>,
    freshness: Duration,
    expiry: Duration,
    active: Option<Arc<TrackerSnapshot>>,
}

impl TrackerDatabase {
    pub fn new(
        cache: SnapshotCache,
        fetcher: Box<dyn SnapshotFetcher>,
        fallback_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            fallback_paths,
            freshness: Duration::days(1),
            expiry: Duration::days(7),
            active: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, FetchError> {
        let fetcher =
            GithubReleaseFetcher::new(&settings.trackerdb_releases_url, settings.fetch_timeout())?;
        Ok(Self::new(
            SnapshotCache::new(settings.trackerdb_cache()),
            Box::new(fetcher),
            settings.trackerdb_fallbacks(),
        )
        .with_bounds(
            Duration::hours(settings.trackerdb_freshness_hours),
            Duration::days(settings.trackerdb_expiry_days),
        ))
    }

    pub fn with_bounds(mut self, freshness: Duration, expiry: Duration) -> Self {
        self.freshness = freshness;
        self.expiry = expiry;
        self
    }

    /// Resolve the snapshot for this run. Later calls return the same snapshot.
    pub async fn load(&mut self) -> Arc<TrackerSnapshot> {
        self.load_at(Utc::now()).await
    }

    pub async fn load_at(&mut self, now: DateTime<Utc>) -> Arc<TrackerSnapshot> {
        if let Some(active) = &self.active {
            return Arc::clone(active);
        }

        self.cache.purge_expired(now, self.expiry);
        let cached = self.cache.read();

        let snapshot = match cached {
            Some(c) if c.age(now) < self.freshness => {
                info!(
                    age_hours = format!("{:.1}", c.age(now).num_minutes() as f64 / 60.0),
                    "Using fresh trackerdb cache"
                );
                c.into_snapshot(false)
            }
            cached => match self.fetch_remote(now).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Trackerdb remote fetch failed: {}", e);
                    match cached {
                        Some(c) if c.age(now) < self.expiry => {
                            warn!("Using stale trackerdb cache (degraded)");
                            c.into_snapshot(true)
                        }
                        _ => self.load_fallback(now),
                    }
                }
            },
        };

        info!(
            source = %snapshot.source,
            patterns = snapshot.pattern_count(),
            degraded = snapshot.degraded,
            "Trackerdb snapshot active"
        );
        let snapshot = Arc::new(snapshot);
        self.active = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Force a remote attempt regardless of cache freshness. On failure the
    /// current snapshot (if any) stays active.
    pub async fn refresh(&mut self) -> Result<Arc<TrackerSnapshot>, FetchError> {
        let snapshot = Arc::new(self.fetch_remote(Utc::now()).await?);
        self.active = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Option<Arc<TrackerSnapshot>> {
        self.active.clone()
    }

    pub fn matches(&self, domain: &str) -> Vec<&TrackerSignature> {
        self.active
            .as_deref()
            .map(|s| s.matches(domain))
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<TrackerDbStatus> {
        self.active.as_deref().map(|s| TrackerDbStatus {
            source: s.source,
            pattern_count: s.pattern_count(),
            domain_count: s.domain_count(),
            degraded: s.degraded,
            release: s.release.clone(),
            fetched_at: s.fetched_at,
        })
    }

    async fn fetch_remote(&self, now: DateTime<Utc>) -> Result<TrackerSnapshot, FetchError> {
        let remote = self.fetcher.fetch().await?;
        let snapshot = TrackerSnapshot::new(
            remote.signatures,
            now,
            SnapshotSource::Remote,
            remote.release,
            false,
        );
        if let Err(e) = self.cache.write(&snapshot) {
            warn!("Could not write trackerdb cache: {}", e);
        } else {
            info!("Trackerdb cached for {}h", self.freshness.num_hours());
        }
        Ok(snapshot)
    }

    fn load_fallback(&self, now: DateTime<Utc>) -> TrackerSnapshot {
        for path in &self.fallback_paths {
            let raw = match fs::read(path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let parsed = serde_json::from_slice::<Value>(&raw)
                .map_err(|e| e.to_string())
                .and_then(|v| snapshot::parse_trackerdb(&v));
            match parsed {
                Ok(signatures) => {
                    let bundled_at = fs::metadata(path)
                        .and_then(|m| m.modified())
                        .map(DateTime::<Utc>::from)
                        .unwrap_or(now);
                    warn!(path = %path.display(), "Using bundled trackerdb fallback");
                    return TrackerSnapshot::new(
                        signatures,
                        bundled_at,
                        SnapshotSource::Fallback,
                        None,
                        true,
                    );
                }
                Err(e) => warn!(path = %path.display(), "Unreadable fallback bundle: {}", e),
            }
        }

        error!(
            "No trackerdb available (remote, cache and fallback all failed); tracker detection disabled"
        );
        for path in &self.fallback_paths {
            error!("  searched: {}", path.display());
        }
        TrackerSnapshot::empty(SnapshotSource::Fallback, now)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::remote::RemoteSnapshot;
    use super::*;

    pub(crate) const SAMPLE_DB: &str = "tests/fixtures/trackerdb_sample.json";

    /// Fake remote that counts invocations.
    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        reachable: bool,
    }

    #[async_trait]
    impl SnapshotFetcher for CountingFetcher {
        async fn fetch(&self) -> Result<RemoteSnapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.reachable {
                return Err(FetchError::Network("connection refused".into()));
            }
            Ok(RemoteSnapshot {
                release: Some("2025.10.1".into()),
                signatures: vec![sig("remote-only.example", "remote_only")],
            })
        }
    }

    fn sig(pattern: &str, key: &str) -> TrackerSignature {
        TrackerSignature {
            pattern: pattern.into(),
            key: key.into(),
            name: key.into(),
            category: "advertising".into(),
            organization: None,
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: TrackerDatabase,
        calls: Arc<AtomicUsize>,
        cache_path: PathBuf,
    }

    fn harness(reachable: bool, fallback: Vec<PathBuf>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("trackerdb/cached.json");
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = CountingFetcher {
            calls: Arc::clone(&calls),
            reachable,
        };
        let db = TrackerDatabase::new(SnapshotCache::new(&cache_path), Box::new(fetcher), fallback);
        Harness {
            _dir: dir,
            db,
            calls,
            cache_path,
        }
    }

    fn seed_cache(path: &PathBuf, fetched_at: DateTime<Utc>) {
        let snap = TrackerSnapshot::new(
            vec![sig("cached-only.example", "cached_only")],
            fetched_at,
            SnapshotSource::Remote,
            None,
            false,
        );
        SnapshotCache::new(path).write(&snap).unwrap();
    }

    #[tokio::test]
    async fn fresh_cache_skips_remote() {
        let mut h = harness(true, vec![]);
        let now = Utc::now();
        seed_cache(&h.cache_path, now - Duration::hours(12));

        let snap = h.db.load_at(now).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(snap.source, SnapshotSource::Cache);
        assert!(!snap.degraded);
        assert_eq!(h.db.matches("cdn.cached-only.example").len(), 1);
    }

    #[tokio::test]
    async fn expired_cache_with_remote_down_uses_fallback() {
        let mut h = harness(false, vec![PathBuf::from(SAMPLE_DB)]);
        let now = Utc::now();
        seed_cache(&h.cache_path, now - Duration::days(8));

        let snap = h.db.load_at(now).await;
        assert_eq!(snap.source, SnapshotSource::Fallback);
        assert!(snap.degraded);
        assert!(!h.cache_path.exists(), "expired cache must be purged");
        assert!(!h.db.matches("connect.facebook.net").is_empty());
    }

    #[tokio::test]
    async fn stale_cache_with_remote_down_is_degraded_cache() {
        let mut h = harness(false, vec![PathBuf::from(SAMPLE_DB)]);
        let now = Utc::now();
        seed_cache(&h.cache_path, now - Duration::days(3));

        let snap = h.db.load_at(now).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snap.source, SnapshotSource::Cache);
        assert!(snap.degraded);
    }

    #[tokio::test]
    async fn stale_cache_with_remote_up_writes_through() {
        let mut h = harness(true, vec![]);
        let now = Utc::now();
        seed_cache(&h.cache_path, now - Duration::days(2));

        let snap = h.db.load_at(now).await;
        assert_eq!(snap.source, SnapshotSource::Remote);
        assert_eq!(snap.release.as_deref(), Some("2025.10.1"));

        let cached = SnapshotCache::new(&h.cache_path).read().unwrap();
        assert_eq!(cached.fetched_at, now);
        assert_eq!(cached.signatures[0].pattern, "remote-only.example");
    }

    #[tokio::test]
    async fn nothing_available_yields_empty_fallback() {
        let mut h = harness(false, vec![PathBuf::from("does/not/exist.json")]);
        let snap = h.db.load_at(Utc::now()).await;
        assert_eq!(snap.source, SnapshotSource::Fallback);
        assert_eq!(snap.pattern_count(), 0);
        assert!(h.db.matches("connect.facebook.net").is_empty());
    }

    #[tokio::test]
    async fn load_is_resolved_once_per_run() {
        let mut h = harness(true, vec![]);
        let first = h.db.load().await;
        let second = h.db.load().await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_current_snapshot() {
        let mut h = harness(false, vec![PathBuf::from(SAMPLE_DB)]);
        let before = h.db.load().await;
        assert!(h.db.refresh().await.is_err());
        assert!(Arc::ptr_eq(&before, &h.db.snapshot().unwrap()));
        assert_eq!(h.db.status().unwrap().source, SnapshotSource::Fallback);
    }

    #[tokio::test]
    async fn future_dated_cache_is_not_served_as_fresh() {
        let mut h = harness(true, vec![]);
        let now = Utc::now();
        seed_cache(&h.cache_path, now + Duration::days(30));

        let snap = h.db.load_at(now).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snap.source, SnapshotSource::Remote);
        assert!(!snap.degraded);

        let cached = SnapshotCache::new(&h.cache_path).read().unwrap();
        assert_eq!(cached.fetched_at, now);
    }

    #[tokio::test]
    async fn future_dated_cache_with_remote_down_falls_back() {
        let mut h = harness(false, vec![PathBuf::from(SAMPLE_DB)]);
        let now = Utc::now();
        seed_cache(&h.cache_path, now + Duration::days(30));

        let snap = h.db.load_at(now).await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(snap.source, SnapshotSource::Fallback);
        assert!(snap.degraded);
    }

    #[tokio::test]
    async fn bundled_fallback_covers_common_trackers() {
        let mut h = harness(false, vec![PathBuf::from("data/fallback/trackerdb.json")]);
        let snap = h.db.load().await;
        assert_eq!(snap.source, SnapshotSource::Fallback);
        assert!(snap.pattern_count() >= 40);
        for host in ["connect.facebook.net", "bat.bing.com", "pro.gemius.com.pl", "static.klaviyo.com"] {
            assert!(!h.db.matches(host).is_empty(), "{host} should match");
        }
    }
}
