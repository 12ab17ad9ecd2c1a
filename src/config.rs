use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Refresh interval in minutes (0 disables scheduled refreshes)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Serve canned items from an in-memory store instead of SQLite
    #[serde(default)]
    pub demo_data: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_refresh_interval() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Outbound request policy for feed fetching.
#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of sources fetched concurrently
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between batches in milliseconds
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    /// Bodies shorter than this are treated as error or block pages
    #[serde(default = "default_min_body_bytes")]
    pub min_body_bytes: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_batch_size() -> usize {
    3
}

fn default_batch_pause_ms() -> u64 {
    250
}

fn default_min_body_bytes() -> usize {
    100
}

fn default_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0 Safari/537.36"
        .to_string()
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            min_body_bytes: default_min_body_bytes(),
            max_body_bytes: default_max_body_bytes(),
            user_agent: default_user_agent(),
        }
    }
}

/// Bounds applied while parsing, normalizing and storing entries.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_items_per_feed")]
    pub items_per_feed: usize,
    /// Number of most recent items persisted per cycle
    #[serde(default = "default_serving_window")]
    pub serving_window: usize,
    #[serde(default = "default_retention_per_source")]
    pub retention_per_source: i64,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    #[serde(default = "default_link_max_chars")]
    pub link_max_chars: usize,
    /// Drop entries whose date cannot be parsed instead of stamping them with the fetch time
    #[serde(default)]
    pub reject_undated: bool,
}

fn default_items_per_feed() -> usize {
    10
}

fn default_serving_window() -> usize {
    50
}

fn default_retention_per_source() -> i64 {
    1000
}

fn default_title_max_chars() -> usize {
    500
}

fn default_summary_max_chars() -> usize {
    1000
}

fn default_link_max_chars() -> usize {
    2000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            items_per_feed: default_items_per_feed(),
            serving_window: default_serving_window(),
            retention_per_source: default_retention_per_source(),
            title_max_chars: default_title_max_chars(),
            summary_max_chars: default_summary_max_chars(),
            link_max_chars: default_link_max_chars(),
            reject_undated: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Display name; derived from the feed title when omitted
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SourceConfig {
    /// Name to register the source under, falling back to the URL's hostname.
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
            .unwrap_or_else(|| self.url.clone())
    }

    pub fn is_auto_named(&self) -> bool {
        self.name.as_deref().map_or(true, |n| n.trim().is_empty())
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.fetch.batch_size == 0 {
            bail!("fetch.batch_size must be at least 1");
        }
        if self.fetch.timeout_secs == 0 {
            bail!("fetch.timeout_secs must be at least 1");
        }
        if self.ingest.items_per_feed == 0 {
            bail!("ingest.items_per_feed must be at least 1");
        }
        if self.ingest.serving_window == 0 {
            bail!("ingest.serving_window must be at least 1");
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let url = Url::parse(&source.url)
                .with_context(|| format!("invalid source url {:?}", source.url))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("source url {:?} must use http or https", source.url);
            }
            if !seen.insert(source.url.as_str()) {
                bail!("duplicate source url {:?}", source.url);
            }
        }
        Ok(())
    }
}
