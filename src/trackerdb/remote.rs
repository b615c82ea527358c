use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::snapshot::{parse_trackerdb, TrackerSignature};
use crate::error::FetchError;

const USER_AGENT: &str = "gtm-scanner/0.1";

/// A signature set pulled from the remote source.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub release: Option<String>,
    pub signatures: Vec<TrackerSignature>,
}

#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self) -> Result<RemoteSnapshot, FetchError>;
}

#[derive(Deserialize)]
struct Release {
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// Fetches the latest TrackerDB release from the GitHub releases API.
pub struct GithubReleaseFetcher {
    client: reqwest::Client,
    releases_url: String,
    timeout: Duration,
}

impl GithubReleaseFetcher {
    pub fn new(releases_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            releases_url: releases_url.to_string(),
            timeout,
        })
    }

    async fn fetch_inner(&self) -> Result<RemoteSnapshot, FetchError> {
        info!("Fetching trackerdb release: {}", self.releases_url);
        let resp = self
            .client
            .get(&self.releases_url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        let release: Release = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        debug!(release = ?release.tag_name, assets = release.assets.len(), "Found release");

        let asset = pick_asset(&release.assets).ok_or(FetchError::NoAsset)?;
        debug!("Downloading asset {}", asset.name);
        let resp = self.client.get(&asset.browser_download_url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;

        let signatures = parse_trackerdb(&data).map_err(FetchError::Parse)?;
        if signatures.is_empty() {
            return Err(FetchError::Parse("release contains no signatures".into()));
        }
        Ok(RemoteSnapshot {
            release: release.tag_name,
            signatures,
        })
    }
}

#[async_trait]
impl SnapshotFetcher for GithubReleaseFetcher {
    async fn fetch(&self) -> Result<RemoteSnapshot, FetchError> {
        // The client timeout bounds each request; this bounds the whole exchange.
        match tokio::time::timeout(self.timeout, self.fetch_inner()).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }
}

/// Prefer an asset named `trackerdb.json`, else the first `.json` asset.
fn pick_asset(assets: &[Asset]) -> Option<&Asset> {
    assets
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case("trackerdb.json"))
        .or_else(|| {
            assets
                .iter()
                .find(|a| a.name.to_ascii_lowercase().ends_with(".json"))
        })
}
