//! TOML configuration.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below. [`load_config`] parses and validates a file; [`Config::default`]
//! gives the same values without a file.
//!
//! ```toml
//! [storage]
//! workspace = "./data"
//!
//! [vectordb]
//! backend = "sqlite"
//! dims = 256
//!
//! [embedding]
//! provider = "hash"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use viking_store_core::fusion::FusionParams;
use viking_store_core::retrieve::RetrieverConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub vectordb: VectorDbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    /// Defaults rooted at `workspace`.
    pub fn for_workspace(workspace: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.workspace = workspace.into();
        config
    }

    /// Root directory of the local object store.
    pub fn fs_root(&self) -> PathBuf {
        self.storage.workspace.join("fs")
    }

    /// Path of the SQLite vector database.
    pub fn vectordb_path(&self) -> PathBuf {
        self.storage.workspace.join("vectordb").join("vectors.sqlite")
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
        }
    }
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransactionConfig {
    #[serde(default = "default_txn_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_parallel_locks")]
    pub max_parallel_locks: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_txn_timeout(),
            check_interval_secs: default_check_interval(),
            max_parallel_locks: default_max_parallel_locks(),
        }
    }
}

impl TransactionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

fn default_txn_timeout() -> u64 {
    3600
}
fn default_check_interval() -> u64 {
    10
}
fn default_max_parallel_locks() -> usize {
    8
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_semantic_concurrency")]
    pub semantic_concurrency: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            semantic_concurrency: default_semantic_concurrency(),
            embedding_concurrency: default_embedding_concurrency(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    200
}
fn default_semantic_concurrency() -> usize {
    1
}
fn default_embedding_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SemanticConfig {
    #[serde(default = "default_max_concurrent_llm")]
    pub max_concurrent_llm: usize,
    #[serde(default = "default_max_file_chars")]
    pub max_file_chars: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            max_concurrent_llm: default_max_concurrent_llm(),
            max_file_chars: default_max_file_chars(),
        }
    }
}

fn default_max_concurrent_llm() -> usize {
    10
}
fn default_max_file_chars() -> usize {
    30000
}

/// Compile-time registry of vector-store backends.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    Cosine,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorDbConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_distance")]
    pub distance: Distance,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            collection: default_collection(),
            dims: default_dims(),
            distance: default_distance(),
        }
    }
}

fn default_backend() -> BackendKind {
    BackendKind::Sqlite
}
fn default_collection() -> String {
    "context".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_distance() -> Distance {
    Distance::Cosine
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_prefetch_multiplier")]
    pub prefetch_multiplier: usize,
    #[serde(default = "default_prefetch_min")]
    pub prefetch_min: usize,
    #[serde(default = "default_alpha")]
    pub score_propagation_alpha: f64,
    #[serde(default = "default_convergence_rounds")]
    pub max_convergence_rounds: usize,
    #[serde(default = "default_global_topk")]
    pub global_search_topk: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            prefetch_multiplier: default_prefetch_multiplier(),
            prefetch_min: default_prefetch_min(),
            score_propagation_alpha: default_alpha(),
            max_convergence_rounds: default_convergence_rounds(),
            global_search_topk: default_global_topk(),
        }
    }
}

impl RetrievalConfig {
    pub fn fusion(&self) -> FusionParams {
        FusionParams {
            k: self.rrf_k,
            prefetch_multiplier: self.prefetch_multiplier,
            prefetch_min: self.prefetch_min,
        }
    }

    pub fn retriever(&self) -> RetrieverConfig {
        RetrieverConfig {
            score_propagation_alpha: self.score_propagation_alpha,
            max_convergence_rounds: self.max_convergence_rounds,
            global_search_topk: self.global_search_topk,
            fusion: self.fusion(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_prefetch_multiplier() -> usize {
    3
}
fn default_prefetch_min() -> usize {
    20
}
fn default_alpha() -> f64 {
    0.5
}
fn default_convergence_rounds() -> usize {
    3
}
fn default_global_topk() -> usize {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Hash,
    OpenAI,
    Ollama,
    Disabled,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    /// Defaults to `vectordb.dims`.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != EmbeddingProviderKind::Disabled
    }
}

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Hash
}
fn default_embedding_timeout() -> u64 {
    30
}
fn default_embedding_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    Extractive,
    OpenAI,
    Ollama,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: LlmProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            url: None,
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
        }
    }
}

fn default_llm_provider() -> LlmProviderKind {
    LlmProviderKind::Extractive
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_llm_retries() -> u32 {
    3
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.vectordb.dims == 0 {
        anyhow::bail!("vectordb.dims must be > 0");
    }
    if config.vectordb.collection.is_empty() {
        anyhow::bail!("vectordb.collection must not be empty");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if let Some(dims) = config.embedding.dims {
        if dims != config.vectordb.dims {
            anyhow::bail!(
                "embedding.dims ({}) must match vectordb.dims ({})",
                dims,
                config.vectordb.dims
            );
        }
    }

    if config.retrieval.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0");
    }
    if !(0.0..=1.0).contains(&config.retrieval.score_propagation_alpha) {
        anyhow::bail!("retrieval.score_propagation_alpha must be in [0.0, 1.0]");
    }
    if config.retrieval.max_convergence_rounds == 0 {
        anyhow::bail!("retrieval.max_convergence_rounds must be >= 1");
    }

    if config.transaction.max_parallel_locks == 0 {
        anyhow::bail!("transaction.max_parallel_locks must be >= 1");
    }
    if config.semantic.max_concurrent_llm == 0 {
        anyhow::bail!("semantic.max_concurrent_llm must be >= 1");
    }
    if config.queue.semantic_concurrency == 0 || config.queue.embedding_concurrency == 0 {
        anyhow::bail!("queue concurrency must be >= 1");
    }

    if matches!(
        config.embedding.provider,
        EmbeddingProviderKind::OpenAI | EmbeddingProviderKind::Ollama
    ) && config.embedding.model.is_none()
    {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{:?}'",
            config.embedding.provider
        );
    }
    if config.llm.provider != LlmProviderKind::Extractive && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{:?}'",
            config.llm.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.transaction.timeout_secs, 3600);
        assert_eq!(config.transaction.check_interval_secs, 10);
        assert_eq!(config.queue.poll_interval_ms, 200);
        assert_eq!(config.semantic.max_concurrent_llm, 10);
        assert_eq!(config.vectordb.backend, BackendKind::Sqlite);
        assert_eq!(config.retrieval.fusion(), FusionParams::default());
        assert_eq!(config.embedding.provider, EmbeddingProviderKind::Hash);
    }

    #[test]
    fn test_paths_derive_from_workspace() {
        let config = Config::for_workspace("/tmp/ws");
        assert_eq!(config.fs_root(), PathBuf::from("/tmp/ws/fs"));
        assert_eq!(
            config.vectordb_path(),
            PathBuf::from("/tmp/ws/vectordb/vectors.sqlite")
        );
    }

    #[test]
    fn test_example_config_parses() {
        let config: Config =
            toml::from_str(include_str!("../config/vk.example.toml")).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.vectordb.dims, 256);
    }

    #[test]
    fn test_rejects_unknown_backend() {
        let parsed: Result<Config, _> = toml::from_str("[vectordb]\nbackend = \"qdrant\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_rejects_alpha_out_of_range() {
        let config: Config = toml::from_str("[retrieval]\nscore_propagation_alpha = 1.5\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_remote_embedding_requires_model() {
        let config: Config = toml::from_str("[embedding]\nprovider = \"openai\"\n").unwrap();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("embedding.model"));
    }

    #[test]
    fn test_embedding_dims_must_match() {
        let config: Config =
            toml::from_str("[vectordb]\ndims = 8\n[embedding]\ndims = 16\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vk.toml");
        std::fs::write(&path, "[storage]\nworkspace = \"/srv/vk\"\n[vectordb]\nbackend = \"memory\"\n")
            .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.storage.workspace, PathBuf::from("/srv/vk"));
        assert_eq!(config.vectordb.backend, BackendKind::Memory);
    }
}
