use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    pub dir: PathBuf,
    #[serde(default = "default_channel_file")]
    pub channel_file: String,
    #[serde(default = "default_processed_file")]
    pub processed_file: String,
    #[serde(default = "default_legacy_file")]
    pub legacy_file: String,
    #[serde(default = "default_max_processed_ids")]
    pub max_processed_ids: usize,
}

fn default_channel_file() -> String {
    "channel_tracking.json".to_string()
}
fn default_processed_file() -> String {
    "processed_messages.json".to_string()
}
fn default_legacy_file() -> String {
    "last_update.json".to_string()
}
fn default_max_processed_ids() -> usize {
    10_000
}

impl TrackingConfig {
    /// Tracking config rooted at `dir` with every other field defaulted.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            channel_file: default_channel_file(),
            processed_file: default_processed_file(),
            legacy_file: default_legacy_file(),
            max_processed_ids: default_max_processed_ids(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelsConfig {
    pub names: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_channel_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub initial_lookback_days: Option<u32>,
}

fn default_max_concurrent() -> usize {
    1
}
fn default_channel_timeout_secs() -> u64 {
    300
}

impl ChannelsConfig {
    /// Configured channel names with any leading `#` removed.
    pub fn normalized_names(&self) -> Vec<String> {
        self.names
            .iter()
            .map(|n| n.trim().trim_start_matches('#').to_string())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_window_size() -> usize {
    5
}
fn default_overlap() -> usize {
    2
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            overlap: default_overlap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    #[serde(default = "default_slack_token_env")]
    pub token_env: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            api_base: default_slack_api_base(),
            token_env: default_slack_token_env(),
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}
fn default_slack_token_env() -> String {
    "SLACK_BOT_TOKEN".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_page_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_index_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            host: None,
            namespace: None,
            api_key_env: default_index_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_index_key_env() -> String {
    "PINECONE_API_KEY".to_string()
}

impl IndexConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.tracking.max_processed_ids == 0 {
        anyhow::bail!("tracking.max_processed_ids must be > 0");
    }

    if config.channels.names.is_empty() {
        anyhow::bail!("channels.names must list at least one channel");
    }
    if config
        .channels
        .normalized_names()
        .iter()
        .any(|n| n.is_empty())
    {
        anyhow::bail!("channels.names must not contain empty names");
    }
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = config
        .channels
        .normalized_names()
        .into_iter()
        .find(|n| !seen.insert(n.clone()))
    {
        anyhow::bail!("channels.names lists '{}' more than once", dup);
    }
    if config.channels.max_concurrent == 0 {
        anyhow::bail!("channels.max_concurrent must be >= 1");
    }
    if config.channels.timeout_secs == 0 {
        anyhow::bail!("channels.timeout_secs must be > 0");
    }

    if config.chunking.window_size == 0 {
        anyhow::bail!("chunking.window_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.window_size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.window_size ({})",
            config.chunking.overlap,
            config.chunking.window_size
        );
    }

    if config.slack.page_size == 0 {
        anyhow::bail!("slack.page_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.index.provider.as_str() {
        "disabled" | "pinecone" => {}
        other => anyhow::bail!(
            "Unknown index provider: '{}'. Must be disabled or pinecone.",
            other
        ),
    }
    if config.index.is_enabled() && config.index.host.is_none() {
        anyhow::bail!(
            "index.host must be specified when provider is '{}'",
            config.index.provider
        );
    }

    Ok(())
}
