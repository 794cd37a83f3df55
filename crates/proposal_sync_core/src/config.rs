use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILENAME: &str = ".proposal-sync.toml";
pub const DEFAULT_USER_AGENT: &str = "proposal-sync/0.1";
pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_RAW_URL: &str = "https://raw.githubusercontent.com";
pub const DEFAULT_OWNER: &str = "tc39";
pub const DEFAULT_REPO: &str = "proposals";
pub const DEFAULT_README_PATH: &str = "README.md";
pub const DEFAULT_START_MARKER: &str = "## Stage 3";
pub const DEFAULT_END_MARKER: &str = "## Stage 2.7";
pub const DEFAULT_OUTPUT_PATH: &str = "_data/stage3.yml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UpstreamSection {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub path: Option<String>,
    pub start_marker: Option<String>,
    pub end_marker: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct OutputSection {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PolicySection {
    #[serde(default)]
    pub presentations: PresentationPolicy,
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub api_url: Option<String>,
    pub raw_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

/// What happens to presentation history already stored for a proposal.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PresentationPolicy {
    /// Only the entry from the current table row is kept.
    #[default]
    Replace,
    /// Stored entries with a different date are kept after the current one.
    Merge,
}

/// How rows resolving to the same identifier are handled.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    #[default]
    KeepAll,
    LastWins,
    Reject,
}

impl PresentationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
        }
    }
}

impl DuplicatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepAll => "keep-all",
            Self::LastWins => "last-wins",
            Self::Reject => "reject",
        }
    }
}

/// Upstream document coordinates with overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub start_marker: String,
    pub end_marker: String,
}

impl SyncConfig {
    /// Resolve the upstream document: env > config > defaults.
    pub fn upstream_target(&self) -> UpstreamTarget {
        UpstreamTarget {
            owner: env_or("PROPOSAL_SYNC_OWNER", self.upstream.owner.as_deref(), DEFAULT_OWNER),
            repo: env_or("PROPOSAL_SYNC_REPO", self.upstream.repo.as_deref(), DEFAULT_REPO),
            path: env_or(
                "PROPOSAL_SYNC_PATH",
                self.upstream.path.as_deref(),
                DEFAULT_README_PATH,
            ),
            start_marker: self
                .upstream
                .start_marker
                .clone()
                .unwrap_or_else(|| DEFAULT_START_MARKER.to_string()),
            end_marker: self
                .upstream
                .end_marker
                .clone()
                .unwrap_or_else(|| DEFAULT_END_MARKER.to_string()),
        }
    }

    /// Resolve the dataset path: env PROPOSAL_SYNC_OUTPUT > config > default.
    pub fn output_path(&self) -> PathBuf {
        if let Some(value) = env_trimmed("PROPOSAL_SYNC_OUTPUT") {
            return PathBuf::from(value);
        }
        self.output
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH))
    }

    pub fn user_agent(&self) -> String {
        env_or(
            "PROPOSAL_SYNC_USER_AGENT",
            self.http.user_agent.as_deref(),
            DEFAULT_USER_AGENT,
        )
    }

    /// Human readable dump used by `--diagnostics`.
    pub fn diagnostics(&self) -> String {
        let upstream = self.upstream_target();
        format!(
            "upstream={}/{}/{}\nstart_marker={}\nend_marker={}\noutput_path={}\npresentations={}\nduplicates={}\napi_url={}\nraw_url={}\nuser_agent={}",
            upstream.owner,
            upstream.repo,
            upstream.path,
            upstream.start_marker,
            upstream.end_marker,
            self.output_path().to_string_lossy().replace('\\', "/"),
            self.policy.presentations.as_str(),
            self.policy.duplicates.as_str(),
            self.http.api_url.as_deref().unwrap_or(DEFAULT_API_URL),
            self.http.raw_url.as_deref().unwrap_or(DEFAULT_RAW_URL),
            self.user_agent(),
        )
    }
}

/// Load and parse a SyncConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<SyncConfig> {
    if !config_path.exists() {
        return Ok(SyncConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: SyncConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    validate_config(&parsed)
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    Ok(parsed)
}

fn validate_config(config: &SyncConfig) -> Result<()> {
    for (key, value) in [
        ("upstream.start_marker", &config.upstream.start_marker),
        ("upstream.end_marker", &config.upstream.end_marker),
    ] {
        if let Some(value) = value
            && value.trim().is_empty()
        {
            bail!("{key} cannot be empty");
        }
    }
    Ok(())
}

fn env_trimmed(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_or(key: &str, configured: Option<&str>, default: &str) -> String {
    env_trimmed(key)
        .or_else(|| configured.map(ToString::to_string))
        .unwrap_or_else(|| default.to_string())
}
