use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{DEFAULT_API_URL, DEFAULT_RAW_URL, SyncConfig};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Owner/name pair of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `https://github.com/<owner>/<name>[/...]`.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("invalid repository URL: {url}"))?;
        let segments = parsed
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|segment| !segment.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        match segments.as_slice() {
            [owner, name, ..] => Ok(Self::new(*owner, name.trim_end_matches(".git"))),
            _ => bail!("repository URL has no owner/name path: {url}"),
        }
    }
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Submodule,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryMetadata {
    pub description: Option<String>,
    /// Top-level listing of the default branch.
    pub entries: Vec<RepositoryEntry>,
}

impl RepositoryMetadata {
    /// Any top-level entry named `path`, whatever its kind.
    pub fn has_top_level_entry(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }
}

/// Remote host holding the upstream README and the proposal repositories.
pub trait ProposalSource: Sync {
    fn fetch_file(&self, repository: &RepositoryRef, path: &str) -> Result<String>;
    fn fetch_repository(&self, repository: &RepositoryRef) -> Result<RepositoryMetadata>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    pub api_url: String,
    pub raw_url: String,
    pub user_agent: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl GitHubClientConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        let http = &config.http;
        Self {
            api_url: http
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            raw_url: http
                .raw_url
                .clone()
                .unwrap_or_else(|| DEFAULT_RAW_URL.to_string()),
            user_agent: config.user_agent(),
            token: env::var("GITHUB_TOKEN")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            timeout_ms: env_value_u64(
                "PROPOSAL_SYNC_HTTP_TIMEOUT_MS",
                http.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            max_retries: env_value_usize(
                "PROPOSAL_SYNC_HTTP_RETRIES",
                http.retries.unwrap_or(DEFAULT_RETRIES),
            ),
            retry_delay_ms: env_value_u64(
                "PROPOSAL_SYNC_HTTP_RETRY_DELAY_MS",
                http.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
        }
    }
}

pub struct GitHubClient {
    client: Client,
    config: GitHubClientConfig,
    request_count: AtomicUsize,
}

impl GitHubClient {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(GitHubClientConfig::from_config(config))
    }

    pub fn new(config: GitHubClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build GitHub HTTP client")?;

        Ok(Self {
            client,
            config,
            request_count: AtomicUsize::new(0),
        })
    }

    fn api_endpoint(&self, path: &str) -> Result<Url> {
        join_url(&self.config.api_url, path)
    }

    fn raw_endpoint(&self, path: &str) -> Result<Url> {
        join_url(&self.config.raw_url, path)
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T> {
        let body = self.get_text(url.clone(), "application/vnd.github+json")?;
        serde_json::from_str(&body).with_context(|| format!("failed to decode response from {url}"))
    }

    fn get_text(&self, url: Url, accept: &str) -> Result<String> {
        for attempt in 0..=self.config.max_retries {
            self.request_count.fetch_add(1, Ordering::Relaxed);
            debug!(%url, attempt, "GET");
            let response = self.authorize(
                self.client
                    .get(url.clone())
                    .header("User-Agent", self.config.user_agent.clone())
                    .header("Accept", accept),
            )
            .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            warn!(%url, %status, attempt, "retrying request");
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("HTTP {} while fetching {url}", status.as_u16());
                    }
                    return response
                        .text()
                        .with_context(|| format!("failed to read response body from {url}"));
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        warn!(%url, %error, attempt, "retrying request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to fetch {url}"));
                }
            }
        }

        bail!("request to {url} exhausted retry budget")
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(8).min(8);
        let scale = 1u64.checked_shl(exponent).unwrap_or(256);
        sleep(Duration::from_millis(
            self.config.retry_delay_ms.saturating_mul(scale),
        ));
    }
}

impl ProposalSource for GitHubClient {
    fn fetch_file(&self, repository: &RepositoryRef, path: &str) -> Result<String> {
        let url = self.raw_endpoint(&format!(
            "{}/{}/HEAD/{}",
            repository.owner,
            repository.name,
            path.trim_start_matches('/')
        ))?;
        self.get_text(url, "text/plain, */*;q=0.1")
            .with_context(|| format!("failed to fetch {path} from {repository}"))
    }

    fn fetch_repository(&self, repository: &RepositoryRef) -> Result<RepositoryMetadata> {
        let repo_url =
            self.api_endpoint(&format!("repos/{}/{}", repository.owner, repository.name))?;
        let summary: RepositoryPayload = self
            .get_json(repo_url)
            .with_context(|| format!("failed to fetch metadata for {repository}"))?;

        let contents_url = self.api_endpoint(&format!(
            "repos/{}/{}/contents/",
            repository.owner, repository.name
        ))?;
        let entries: Vec<RepositoryEntry> = self
            .get_json(contents_url)
            .with_context(|| format!("failed to list files of {repository}"))?;

        Ok(RepositoryMetadata {
            description: summary
                .description
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            entries,
        })
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    #[serde(default)]
    description: Option<String>,
}

fn join_url(base: &str, path: &str) -> Result<Url> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), path);
    Url::parse(&joined).with_context(|| format!("invalid URL: {joined}"))
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}
