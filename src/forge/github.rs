//! GitHub REST API client.
//!
//! JSON API responses are cached in the `api` cache keyed by request URL;
//! raw file contents fetched at a tag go through the `files` cache.  A
//! non-success status is an error and is never cached.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::cache::{Cache, CacheError};
use crate::config::UpstreamConfig;
use crate::metrics::{EndpointLabels, Metrics};

use super::rate_limit::{RateLimitState, RateLimited};
use super::{ForgeBackend, Release};

const API_ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseEntry {
    tag_name: String,
    #[serde(default)]
    assets: Vec<AssetEntry>,
}

#[derive(Debug, Deserialize)]
struct AssetEntry {
    name: String,
    browser_download_url: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    raw_url: String,
    token: Option<String>,
    rate_limit: RateLimitState,
    rate_limit_buffer: u32,
    api_cache: Arc<Cache<Bytes>>,
    files_cache: Arc<Cache<Bytes>>,
    metrics: Option<Arc<Metrics>>,
}

impl GitHubClient {
    pub fn new(
        http: reqwest::Client,
        config: &UpstreamConfig,
        token: Option<String>,
        api_cache: Arc<Cache<Bytes>>,
        files_cache: Arc<Cache<Bytes>>,
    ) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            raw_url: config.raw_url.trim_end_matches('/').to_string(),
            token,
            rate_limit: RateLimitState::new(),
            rate_limit_buffer: config.rate_limit_buffer,
            api_cache,
            files_cache,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `GET /repos/{owner}/{repo}/tags`
    #[instrument(skip(self))]
    pub async fn get_tags(&self, owner: &str, repo: &str) -> Result<Vec<String>> {
        let url = format!("{}/repos/{owner}/{repo}/tags", self.api_url);
        let tags: Vec<TagEntry> = self.api_json("tags", &url).await?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    /// `GET /repos/{owner}/{repo}/releases`, keeping releases that ship a
    /// zip asset.
    #[instrument(skip(self))]
    pub async fn get_releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>> {
        let url = format!("{}/repos/{owner}/{repo}/releases", self.api_url);
        let entries: Vec<ReleaseEntry> = self.api_json("releases", &url).await?;
        Ok(zip_releases(entries))
    }

    /// Raw contents of `path` at `git_ref`.
    #[instrument(skip(self))]
    pub async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<String> {
        anyhow::ensure!(path.starts_with('/'), "path must start with '/': {path}");
        let url = format!("{}/{owner}/{repo}/{git_ref}{path}", self.raw_url);

        let body = self
            .files_cache
            .get_or_else(&url, || self.fetch_raw(&url))
            .await
            .map_err(unshare)?;

        String::from_utf8(body.to_vec()).with_context(|| format!("{url} is not valid UTF-8"))
    }

    async fn api_json<T: DeserializeOwned>(&self, endpoint: &'static str, url: &str) -> Result<T> {
        let body = self
            .api_cache
            .get_or_else(url, || self.fetch_api(endpoint, url))
            .await
            .map_err(unshare)?;

        serde_json::from_slice(&body)
            .with_context(|| format!("failed to parse GitHub API response from {url}"))
    }

    async fn fetch_api(&self, endpoint: &'static str, url: &str) -> Result<Bytes> {
        self.rate_limit.check(self.rate_limit_buffer)?;
        self.count_call(endpoint);
        debug!(%url, "calling GitHub API");

        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, API_ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("GitHub API request failed: {url}"))?;

        if let Some(remaining) = self.rate_limit.update_from_headers(resp.headers()) {
            if let Some(metrics) = &self.metrics {
                metrics
                    .upstream_api_rate_limit_remaining
                    .set(i64::try_from(remaining).unwrap_or(i64::MAX));
            }
        }

        let status = resp.status();
        if !status.is_success() {
            warn!(%url, %status, "GitHub API returned non-success status");
            bail!("GitHub API returned {status} for {url}");
        }

        resp.bytes()
            .await
            .with_context(|| format!("failed to read GitHub API response from {url}"))
    }

    async fn fetch_raw(&self, url: &str) -> Result<Bytes> {
        self.count_call("raw");
        debug!(%url, "fetching raw file");

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("raw file request failed: {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(%url, %status, "raw file fetch returned non-success status");
            bail!("fetching {url} returned {status}");
        }

        resp.bytes()
            .await
            .with_context(|| format!("failed to read raw file {url}"))
    }

    fn count_call(&self, endpoint: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .upstream_api_calls
                .get_or_create(&EndpointLabels {
                    endpoint: endpoint.to_string(),
                })
                .inc();
        }
    }
}

#[async_trait::async_trait]
impl ForgeBackend for GitHubClient {
    async fn tags(&self, owner: &str, repo: &str) -> Result<Vec<String>> {
        self.get_tags(owner, repo).await
    }

    async fn releases(&self, owner: &str, repo: &str) -> Result<Vec<Release>> {
        self.get_releases(owner, repo).await
    }

    async fn file_content(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<String> {
        self.get_file_content(owner, repo, git_ref, path).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pair each release with its first `.zip` asset, dropping releases that
/// have none.  Order is preserved.
fn zip_releases(entries: Vec<ReleaseEntry>) -> Vec<Release> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let asset = entry.assets.into_iter().find(|a| a.name.ends_with(".zip"))?;
            Some(Release {
                tag: entry.tag_name,
                zip_url: asset.browser_download_url,
            })
        })
        .collect()
}

/// Unwrap a cache error, keeping a rate-limit refusal recognisable even
/// when the failure was shared with other waiters.
fn unshare(err: CacheError) -> anyhow::Error {
    let limited = err
        .producer_error()
        .and_then(|e| e.downcast_ref::<RateLimited>())
        .copied();
    match limited {
        Some(limited) => anyhow::Error::new(limited),
        None => err.into_anyhow(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
