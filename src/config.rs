use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub files: FilesConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub conversations: ConversationsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    pub folder: PathBuf,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Files larger than this are skipped without being read.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**".to_string()]
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_refresh_interval_secs() -> u64 {
    3600
}

impl FilesConfig {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            recursive: false,
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_words")]
    pub window_words: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

fn default_window_words() -> usize {
    100
}
fn default_overlap_words() -> usize {
    20
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_words: default_window_words(),
            overlap_words: default_overlap_words(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Only chunks scoring strictly above this cosine similarity are
    /// returned. The default `0.0` drops chunks unrelated to the query.
    #[serde(default)]
    pub min_score: f32,
    /// Characters of context kept around a lexical match.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

fn default_top_k() -> usize {
    3
}
fn default_snippet_chars() -> usize {
    300
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: 0.0,
            snippet_chars: default_snippet_chars(),
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
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

/// The chat model endpoint used for negotiation and synthesis.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_url")]
    pub url: String,
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Upper bound on a single request to the model backend.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model_name() -> String {
    "mistral".to_string()
}
fn default_model_timeout_secs() -> u64 {
    20
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: default_model_url(),
            model: default_model_name(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Deadline for a whole chat turn, negotiation included.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_synthesis_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            attempts: default_synthesis_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SynthesisConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationsConfig {
    #[serde(default = "default_conversations_path")]
    pub path: PathBuf,
}

fn default_conversations_path() -> PathBuf {
    PathBuf::from("conversations.json")
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            path: default_conversations_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Config {
    /// A configuration with every section at its default, reading documents
    /// from `folder`.
    pub fn minimal(folder: impl Into<PathBuf>) -> Self {
        Self {
            files: FilesConfig::new(folder),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            model: ModelConfig::default(),
            negotiation: NegotiationConfig::default(),
            synthesis: SynthesisConfig::default(),
            conversations: ConversationsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Example configuration written by `docchat init`.
pub const EXAMPLE_CONFIG: &str = r#"[files]
folder = "./files"
recursive = false
include_globs = ["**"]
exclude_globs = []
refresh_interval_secs = 3600

[chunking]
window_words = 100
overlap_words = 20

[retrieval]
top_k = 3
min_score = 0.0
snippet_chars = 300

[embedding]
# disabled | hashing | ollama | openai | local
provider = "hashing"
dims = 256

[model]
url = "http://localhost:11434"
model = "mistral"
timeout_secs = 20

[negotiation]
max_attempts = 5

[synthesis]
attempts = 3
retry_delay_ms = 500
request_timeout_secs = 120

[conversations]
path = "conversations.json"

[server]
bind = "127.0.0.1:5000"
"#;

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking: the window must advance on every step
    if config.chunking.window_words == 0 {
        anyhow::bail!("chunking.window_words must be > 0");
    }
    if config.chunking.overlap_words >= config.chunking.window_words {
        anyhow::bail!(
            "chunking.overlap_words ({}) must be < chunking.window_words ({})",
            config.chunking.overlap_words,
            config.chunking.window_words
        );
    }

    // Retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.snippet_chars == 0 {
        anyhow::bail!("retrieval.snippet_chars must be > 0");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    if config.files.refresh_interval_secs == 0 {
        anyhow::bail!("files.refresh_interval_secs must be > 0");
    }

    // Model backend
    let url = config.model.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("model.url must start with http:// or https://");
    }
    if config.model.model.trim().is_empty() {
        anyhow::bail!("model.model must not be empty");
    }
    if config.model.timeout_secs == 0 {
        anyhow::bail!("model.timeout_secs must be > 0");
    }

    if config.negotiation.max_attempts < 1 {
        anyhow::bail!("negotiation.max_attempts must be >= 1");
    }
    if config.synthesis.attempts < 1 {
        anyhow::bail!("synthesis.attempts must be >= 1");
    }
    if config.synthesis.request_timeout_secs == 0 {
        anyhow::bail!("synthesis.request_timeout_secs must be > 0");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hashing" | "ollama" | "openai" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, ollama, openai, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if matches!(config.embedding.provider.as_str(), "ollama" | "openai")
        && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    Ok(())
}
