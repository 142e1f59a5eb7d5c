use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/docket.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
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
    /// Base URL for the `ollama` provider, or an OpenAI-compatible endpoint.
    #[serde(default)]
    pub url: Option<String>,
    /// Longest text sent in one embedding input. Longer records are chunked
    /// and mean-pooled. Defaults per provider, see [`EmbeddingConfig::input_limit`].
    #[serde(default)]
    pub max_input_chars: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
            max_input_chars: None,
        }
    }
}

fn default_provider() -> String {
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

    /// Characters per embedding input: the configured value, or roughly
    /// three quarters of the provider's usual token window at 4 chars/token.
    pub fn input_limit(&self) -> usize {
        self.max_input_chars.unwrap_or(match self.provider.as_str() {
            "openai" => 24_000,
            "ollama" => 6_000,
            "local" => 1_000,
            _ => usize::MAX,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Minimum number of corpus candidates considered per query.
    #[serde(default = "default_k_corpus")]
    pub k_corpus: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
    #[serde(default = "default_live_timeout_secs")]
    pub live_timeout_secs: u64,
    /// Indexes at or below this size are searched exhaustively.
    #[serde(default = "default_exact_scan_threshold")]
    pub exact_scan_threshold: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_corpus: default_k_corpus(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            live_timeout_secs: default_live_timeout_secs(),
            exact_scan_threshold: default_exact_scan_threshold(),
        }
    }
}

fn default_k_corpus() -> usize {
    50
}
fn default_top_k() -> usize {
    10
}
fn default_max_top_k() -> usize {
    100
}
fn default_live_timeout_secs() -> u64 {
    20
}
fn default_exact_scan_threshold() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    300
}
fn default_max_entries() -> u64 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    /// Excerpt length; longer documents are truncated before embedding.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Last filing date covered by the historical corpus. Filters reaching
    /// past it trigger the live path.
    #[serde(default)]
    pub coverage_end: Option<NaiveDate>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: None,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
            coverage_end: None,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.htm".to_string(),
        "**/*.html".to_string(),
        "**/*.txt".to_string(),
    ]
}
fn default_min_chars() -> usize {
    100
}
fn default_max_chars() -> usize {
    50_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LiveConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_live_base_url")]
    pub base_url: String,
    #[serde(default = "default_form_type")]
    pub form_type: String,
    #[serde(default = "default_exhibit_prefix")]
    pub exhibit_prefix: String,
    #[serde(default = "default_days_back")]
    pub days_back: i64,
    #[serde(default = "default_max_filings")]
    pub max_filings: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key_env: default_api_key_env(),
            base_url: default_live_base_url(),
            form_type: default_form_type(),
            exhibit_prefix: default_exhibit_prefix(),
            days_back: default_days_back(),
            max_filings: default_max_filings(),
            user_agent: default_user_agent(),
            download_delay_ms: default_download_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LiveConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_api_key_env() -> String {
    "SEC_API_KEY".to_string()
}
fn default_live_base_url() -> String {
    "https://api.sec-api.io".to_string()
}
fn default_form_type() -> String {
    "8-K".to_string()
}
fn default_exhibit_prefix() -> String {
    "EX-10".to_string()
}
fn default_days_back() -> i64 {
    30
}
fn default_max_filings() -> usize {
    20
}
fn default_user_agent() -> String {
    format!("docket/{} (contract research)", env!("CARGO_PKG_VERSION"))
}
fn default_download_delay_ms() -> u64 {
    500
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
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let r = &config.retrieval;
    if r.default_top_k == 0 {
        anyhow::bail!("retrieval.default_top_k must be >= 1");
    }
    if r.max_top_k < r.default_top_k {
        anyhow::bail!("retrieval.max_top_k must be >= retrieval.default_top_k");
    }
    if r.k_corpus == 0 {
        anyhow::bail!("retrieval.k_corpus must be >= 1");
    }
    if r.live_timeout_secs == 0 {
        anyhow::bail!("retrieval.live_timeout_secs must be > 0");
    }

    if config.cache.enabled && config.cache.max_entries == 0 {
        anyhow::bail!("cache.max_entries must be > 0 when the cache is enabled");
    }

    if config.corpus.max_chars == 0 {
        anyhow::bail!("corpus.max_chars must be > 0");
    }
    if config.corpus.min_chars > config.corpus.max_chars {
        anyhow::bail!("corpus.min_chars must not exceed corpus.max_chars");
    }

    let emb = &config.embedding;
    if emb.is_enabled() {
        if emb.dims.is_none() || emb.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                emb.provider
            );
        }
        if emb.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                emb.provider
            );
        }
        if emb.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if emb.max_input_chars == Some(0) {
            anyhow::bail!("embedding.max_input_chars must be > 0");
        }
    }

    match emb.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    match config.live.provider.as_str() {
        "disabled" | "sec-api" => {}
        other => anyhow::bail!(
            "Unknown live provider: '{}'. Must be disabled or sec-api.",
            other
        ),
    }
    if config.live.is_enabled() && config.live.max_filings == 0 {
        anyhow::bail!("live.max_filings must be >= 1");
    }

    Ok(())
}
