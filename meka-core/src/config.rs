//! Configuration system for MEKA.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/meka/config.toml` and/or `.meka/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::embeddings::EmbeddingConfig;

/// Top-level configuration for MEKA.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MekaConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub reranker: RerankerConfig,
    pub web: WebConfig,
    pub corpus: CorpusConfig,
    pub checkpoint: CheckpointConfig,
    pub pipeline: PipelineConfig,
}

impl MekaConfig {
    /// Collect warnings from every section.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.llm.validate();
        warnings.extend(self.retrieval.validate());
        warnings.extend(self.reranker.validate());
        warnings.extend(self.web.validate());
        warnings.extend(self.corpus.validate());
        warnings.extend(self.pipeline.validate());
        warnings
    }

    /// Render the effective configuration as TOML. Inline API keys are never
    /// serialized.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Retry behavior for transient LLM failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "groq", "openai", "ollama", or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "llama-3.1-8b-instant").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Inline API key. Takes precedence over `api_key_env`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    /// HTTP timeout for a single completion call.
    pub timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "groq".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.2,
            max_tokens: None,
            timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    ///
    /// Returns an empty Vec if the config is valid. Missing credentials are not
    /// reported here; they are a hard error when the provider is constructed.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "llm.temperature ({}) is outside the typical range 0.0-2.0",
                self.temperature
            ));
        }
        if self.model.trim().is_empty() {
            warnings.push("llm.model is empty".to_string());
        }
        if self.timeout_secs == 0 {
            warnings.push("llm.timeout_secs is 0; every completion will time out".to_string());
        }
        warnings
    }
}

/// Hybrid retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Vector similarity results forming the base list.
    pub vector_k: usize,
    /// BM25 results considered for the lexical tail.
    pub lexical_k: usize,
    /// Maximum web results appended when web search is enabled.
    pub web_max_results: usize,
    /// SQLite file holding the persisted vector index.
    pub index_path: PathBuf,
    /// Upper bound on the cold-start rebuild of an empty vector index.
    pub cold_start_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_k: 5,
            lexical_k: 5,
            web_max_results: 3,
            index_path: PathBuf::from(".meka/vectors.db"),
            cold_start_timeout_secs: 300,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.vector_k == 0 && self.lexical_k == 0 {
            warnings.push(
                "retrieval.vector_k and retrieval.lexical_k are both 0; only web results can be retrieved"
                    .to_string(),
            );
        }
        if self.cold_start_timeout_secs == 0 {
            warnings.push("retrieval.cold_start_timeout_secs is 0".to_string());
        }
        warnings
    }
}

/// Relevance scorer backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RerankerProvider {
    /// Local query/passage term overlap.
    #[default]
    Overlap,
    /// HTTP cross-encoder served with the text-embeddings-inference `/rerank` API.
    CrossEncoder,
}

impl std::fmt::Display for RerankerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RerankerProvider::Overlap => write!(f, "overlap"),
            RerankerProvider::CrossEncoder => write!(f, "cross-encoder"),
        }
    }
}

/// Reranker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub provider: RerankerProvider,
    /// Base URL of the cross-encoder server.
    pub base_url: String,
    /// Model name reported in logs; the server decides which model it runs.
    pub model: String,
    /// Number of documents kept after reranking.
    pub top_k: usize,
    pub timeout_secs: u64,
    /// Passages sent per scoring request.
    pub batch_size: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: RerankerProvider::Overlap,
            base_url: "http://localhost:8080".to_string(),
            model: "cross-encoder/ms-marco-MiniLM-L-6-v2".to_string(),
            top_k: 5,
            timeout_secs: 30,
            batch_size: 32,
        }
    }
}

impl RerankerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.top_k == 0 {
            warnings.push("reranker.top_k is 0; the synthesizer will see no context".to_string());
        }
        if self.batch_size == 0 {
            warnings.push("reranker.batch_size is 0; falling back to a single batch".to_string());
        }
        warnings
    }
}

/// Web search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Master switch. Web search also requires a credential.
    pub enabled: bool,
    pub provider: String,
    pub api_key_env: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Tavily search depth: "basic" or "advanced".
    pub search_depth: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "tavily".to_string(),
            api_key_env: "TAVILY_API_KEY".to_string(),
            api_key: None,
            base_url: "https://api.tavily.com".to_string(),
            timeout_secs: 15,
            search_depth: "basic".to_string(),
        }
    }
}

impl WebConfig {
    /// Resolve the web search credential from the inline key or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.provider != "tavily" {
            warnings.push(format!(
                "web.provider '{}' is not supported; web search will be disabled",
                self.provider
            ));
        }
        if !matches!(self.search_depth.as_str(), "basic" | "advanced") {
            warnings.push(format!(
                "web.search_depth '{}' should be 'basic' or 'advanced'",
                self.search_depth
            ));
        }
        warnings
    }
}

/// Document corpus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Directory scanned for documents.
    pub path: PathBuf,
    /// File extensions (without dot) included in the corpus.
    pub extensions: Vec<String>,
    /// Maximum chunk length in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks of a long passage.
    pub chunk_overlap: usize,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data"),
            extensions: vec!["txt".to_string(), "md".to_string()],
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

impl CorpusConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.chunk_size == 0 {
            warnings.push("corpus.chunk_size is 0".to_string());
        }
        if self.chunk_overlap >= self.chunk_size {
            warnings.push(format!(
                "corpus.chunk_overlap ({}) >= corpus.chunk_size ({}); overlap will be ignored",
                self.chunk_overlap, self.chunk_size
            ));
        }
        if self.extensions.is_empty() {
            warnings.push("corpus.extensions is empty; no files will be loaded".to_string());
        }
        warnings
    }
}

/// Where thread checkpoints live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Process-local; lost on exit.
    Memory,
    /// One JSON file per thread.
    #[default]
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    /// Directory for the file backend.
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::File,
            path: PathBuf::from(".meka/threads"),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-stage timeout. `None` disables it.
    pub stage_timeout_secs: Option<u64>,
    /// Thread used when the caller does not name one.
    pub default_thread_id: String,
    /// Finished background runs kept for status queries; older ones are evicted.
    pub max_finished_runs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: None,
            default_thread_id: "default_user".to_string(),
            max_finished_runs: 100,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.stage_timeout_secs == Some(0) {
            warnings.push("pipeline.stage_timeout_secs is 0; every stage will time out".to_string());
        }
        if self.default_thread_id.trim().is_empty() {
            warnings.push("pipeline.default_thread_id is empty".to_string());
        }
        if self.max_finished_runs == 0 {
            warnings.push(
                "pipeline.max_finished_runs is 0; submitted runs are forgotten as soon as they finish"
                    .to_string(),
            );
        }
        warnings
    }
}

/// Load configuration with layered merging:
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `MEKA_`)
/// 3. Workspace-local config (`.meka/config.toml`)
/// 4. User config (`~/.config/meka/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&MekaConfig>,
) -> Result<MekaConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(MekaConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "meka", "meka") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".meka").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // MEKA_LLM__MODEL, MEKA_RETRIEVAL__VECTOR_K, etc.
    figment = figment.merge(Env::prefixed("MEKA_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Resolve `path` against `workspace` unless it is already absolute.
pub fn resolve_path(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}
