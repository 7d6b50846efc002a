use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Knowledge groups keyed by name. Each group is one ingestion source
    /// with its own run state machine.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Chunk budget in characters, including carried heading/table context.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    crate::chunk::DEFAULT_MAX_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Raw candidates fetched from the index before reranking.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Passages kept after reranking.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_n: default_top_n(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_top_n() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"ollama"`, or `"lexical"` (offline term vectors).
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embed_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embed_provider() -> String {
    "lexical".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    /// `"memory"` or `"remote"`. Selected per process; groups may override
    /// with `indexer = "<backend>"` in their own table.
    #[serde(default = "default_indexer_backend")]
    pub backend: String,
    /// Base URL of the remote vector service (remote backend only).
    #[serde(default)]
    pub url: Option<String>,
    /// API key environment variable name (remote backend only).
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            backend: default_indexer_backend(),
            url: None,
            api_key_env: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_indexer_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Model key resolved through the model registry (see `llm::get_model`).
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Override the OpenAI-compatible base URL from the registry.
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key environment variable name.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Hard cap on search tool invocations per answer turn.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    /// Hard cap on model round-trips per answer turn.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            max_tool_calls: default_max_tool_calls(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_tool_calls() -> usize {
    5
}
fn default_max_steps() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    /// Maximum completed pages across all groups of one tenant.
    #[serde(default = "default_pages_limit")]
    pub pages: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            pages: default_pages_limit(),
        }
    }
}

fn default_pages_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8091".to_string()
}

/// One configured knowledge group. The `kind` field selects the processor;
/// the remaining fields apply only to the kinds that read them.
#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    /// `web`, `github-repo`, `github-issues`, `upload`, `video`, or `wiki`.
    pub kind: String,
    /// Root locator: start URL, repository URL, file path, or handle.
    #[serde(default)]
    pub url: Option<String>,
    /// Branch for `github-repo` groups.
    #[serde(default)]
    pub branch: Option<String>,
    /// Only follow links matching the root URL prefix.
    #[serde(default)]
    pub match_prefix: bool,
    /// Comma-separated regexes; matching links are never queued.
    #[serde(default)]
    pub skip_page_regex: Option<String>,
    /// CSS selectors removed from fetched HTML before text extraction.
    #[serde(default)]
    pub remove_html_tags: Option<String>,
    /// Persist 404 responses as items instead of recording an error.
    #[serde(default)]
    pub include_404: bool,
    /// Delete items whose key disappeared from the source after a
    /// successful run.
    #[serde(default)]
    pub remove_stale_pages: bool,
    /// Always fetch with the script-rendering strategy.
    #[serde(default)]
    pub load_dynamically: bool,
    /// Selector to scroll for infinite-scroll pages (dynamic fetch only).
    #[serde(default)]
    pub scroll_selector: Option<String>,
    /// Static text shorter than this triggers the dynamic fallback.
    #[serde(default)]
    pub static_content_threshold: Option<usize>,
    /// Page limit for one run.
    #[serde(default)]
    pub page_limit: Option<usize>,
    /// Sync cadence: `daily`, `weekly`, `monthly`, or `manual`.
    #[serde(default = "default_update_frequency")]
    pub update_frequency: String,
    /// Context string prepended to every chunk of this group's items.
    #[serde(default)]
    pub item_context: Option<String>,
    /// Per-group indexer backend override.
    #[serde(default)]
    pub indexer: Option<String>,
    /// Per-group relevance floor on top of the backend's own.
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Extra system prompt appended for this group's answers.
    #[serde(default)]
    pub chat_prompt: Option<String>,
}

fn default_update_frequency() -> String {
    "manual".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.retrieval.top_n == 0 || config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k and retrieval.top_n must be >= 1");
    }
    if config.retrieval.top_n > config.retrieval.top_k {
        anyhow::bail!("retrieval.top_n must not exceed retrieval.top_k");
    }

    match config.embedding.provider.as_str() {
        "openai" | "ollama" | "lexical" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai, ollama, or lexical.",
            other
        ),
    }

    if config.embedding.provider != "lexical" {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.indexer.backend.as_str() {
        "memory" | "remote" => {}
        other => anyhow::bail!(
            "Unknown indexer backend: '{}'. Must be memory or remote.",
            other
        ),
    }

    if config.indexer.backend == "remote" && config.indexer.url.is_none() {
        anyhow::bail!("indexer.url is required for the remote backend");
    }

    if config.quota.pages < 1 {
        anyhow::bail!("quota.pages must be >= 1");
    }

    for (name, group) in &config.groups {
        match group.kind.as_str() {
            "web" | "github-repo" | "github-issues" | "upload" | "video" | "wiki" => {}
            other => anyhow::bail!("groups.{}: unknown kind '{}'", name, other),
        }
        match group.update_frequency.as_str() {
            "daily" | "weekly" | "monthly" | "manual" => {}
            other => anyhow::bail!("groups.{}: unknown update_frequency '{}'", name, other),
        }
        if group.kind != "upload" && group.url.is_none() {
            anyhow::bail!("groups.{}: url is required for kind '{}'", name, group.kind);
        }
    }

    Ok(config)
}

impl Config {
    /// Minimal config for subcommands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/ragbase.sqlite"),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            indexer: IndexerConfig::default(),
            llm: LlmConfig::default(),
            quota: QuotaConfig::default(),
            server: ServerConfig::default(),
            groups: BTreeMap::new(),
        }
    }
}
