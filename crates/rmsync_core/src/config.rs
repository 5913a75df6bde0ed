use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://rickandmortyapi.com/api";
pub const DEFAULT_USER_AGENT: &str = "rmsync/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 50;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30 * 60;
pub const DEFAULT_INITIAL_DELAY_SECS: u64 = 30;

/// Upper bound on ids per `/character/{ids}` request accepted upstream.
pub const BATCH_FETCH_LIMIT: usize = 20;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub ingestion: IngestionSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct IngestionSection {
    pub enabled: Option<bool>,
    pub refresh_interval_secs: Option<u64>,
    pub initial_delay_secs: Option<u64>,
    pub batch_size: Option<usize>,
}

impl SyncConfig {
    /// Resolve the upstream base URL: env RMSYNC_API_BASE > config > DEFAULT_API_BASE.
    pub fn api_base(&self) -> String {
        self.api_base_with_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn api_base_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup_env("RMSYNC_API_BASE") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.api
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    /// Resolve user agent: env RMSYNC_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub(crate) fn user_agent_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup_env("RMSYNC_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.api
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn ingestion_enabled(&self) -> bool {
        self.ingestion.enabled.unwrap_or(true)
    }

    pub fn refresh_interval_secs(&self) -> u64 {
        self.ingestion
            .refresh_interval_secs
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS)
    }

    pub fn initial_delay_secs(&self) -> u64 {
        self.ingestion
            .initial_delay_secs
            .unwrap_or(DEFAULT_INITIAL_DELAY_SECS)
    }

    /// Resident ids per batch request, clamped to what upstream accepts.
    pub fn batch_size(&self) -> usize {
        self.ingestion
            .batch_size
            .unwrap_or(BATCH_FETCH_LIMIT)
            .clamp(1, BATCH_FETCH_LIMIT)
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
    Ok(parsed)
}

/// Rendered body for a freshly initialized `config.toml`.
pub fn default_config_toml() -> String {
    format!(
        r#"[api]
base_url = "{DEFAULT_API_BASE}"
user_agent = "{DEFAULT_USER_AGENT}"
timeout_ms = {DEFAULT_TIMEOUT_MS}
max_retries = {DEFAULT_MAX_RETRIES}
retry_delay_ms = {DEFAULT_RETRY_DELAY_MS}
rate_limit_ms = {DEFAULT_RATE_LIMIT_MS}

[ingestion]
enabled = true
refresh_interval_secs = {DEFAULT_REFRESH_INTERVAL_SECS}
initial_delay_secs = {DEFAULT_INITIAL_DELAY_SECS}
batch_size = {BATCH_FETCH_LIMIT}
"#
    )
}
