//! Configuration parsing and validation.
//!
//! The pipeline is driven by a single TOML file (default
//! `./config/canon.toml`). Every section except `[[sources]]` has
//! defaults, so a minimal config only lists the sources.
//!
//! ```toml
//! [output]
//! dir = "./data/canonical"
//!
//! [[sources]]
//! tag = "K1"
//! kind = "verses"
//! path = "./data/raw/k1"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use scripture_canon_core::ids::PrecedenceOrder;
use scripture_canon_core::merge::SourcePriority;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_master_verses")]
    pub master_verses: String,
    #[serde(default = "default_authors")]
    pub authors: String,
    #[serde(default = "default_qa_records")]
    pub qa_records: String,
    #[serde(default = "default_clusters")]
    pub clusters: String,
    #[serde(default = "default_chapters")]
    pub chapters: String,
    #[serde(default = "default_rejections")]
    pub rejections: String,
    /// Rename the file a run replaces to `<file>.prev` instead of deleting it.
    #[serde(default = "default_true")]
    pub keep_previous: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            master_verses: default_master_verses(),
            authors: default_authors(),
            qa_records: default_qa_records(),
            clusters: default_clusters(),
            chapters: default_chapters(),
            rejections: default_rejections(),
            keep_previous: true,
        }
    }
}

impl OutputConfig {
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Canonical output files, in the order they are packaged.
    pub fn files(&self) -> Vec<&str> {
        vec![
            self.master_verses.as_str(),
            self.authors.as_str(),
            self.qa_records.as_str(),
            self.clusters.as_str(),
            self.chapters.as_str(),
            self.rejections.as_str(),
        ]
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./data/canonical")
}
fn default_master_verses() -> String {
    "master_verses.jsonl".to_string()
}
fn default_authors() -> String {
    "authors.jsonl".to_string()
}
fn default_qa_records() -> String {
    "qa_records.jsonl".to_string()
}
fn default_clusters() -> String {
    "clusters.jsonl".to_string()
}
fn default_chapters() -> String {
    "chapters.jsonl".to_string()
}
fn default_rejections() -> String {
    "rejections.jsonl".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistryConfig {
    /// Persisted author registry. Defaults to the authors file in `[output]`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Reviewed alias list (TOML with `[[authors]]` tables).
    #[serde(default)]
    pub aliases: Option<PathBuf>,
}

impl RegistryConfig {
    pub fn resolved_path(&self, output: &OutputConfig) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| output.path(&output.authors))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MergeConfig {
    #[serde(default = "default_scripture")]
    pub scripture: String,
    #[serde(default = "default_source_priority")]
    pub source_priority: Vec<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            scripture: default_scripture(),
            source_priority: default_source_priority(),
        }
    }
}

impl MergeConfig {
    pub fn priority(&self) -> SourcePriority {
        SourcePriority::new(self.source_priority.iter().cloned())
    }
}

fn default_scripture() -> String {
    "bhagavad_gita".to_string()
}
fn default_source_priority() -> Vec<String> {
    ["GH3", "GH2", "HF2", "K2", "K1", "HF3"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_qa_source_order")]
    pub source_order: Vec<String>,
    #[serde(default = "default_language_order")]
    pub language_order: Vec<String>,
    /// Buckets embedded concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            source_order: default_qa_source_order(),
            language_order: default_language_order(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl ClusteringConfig {
    pub fn precedence(&self) -> PrecedenceOrder {
        PrecedenceOrder::new(self.source_order.iter().cloned(), self.language_order.iter().cloned())
    }
}

fn default_threshold() -> f32 {
    0.82
}
fn default_qa_source_order() -> Vec<String> {
    vec!["HF1".to_string(), "K3".to_string()]
}
fn default_language_order() -> Vec<String> {
    ["en", "hi", "sa"].iter().map(|s| s.to_string()).collect()
}
fn default_max_concurrency() -> usize {
    4
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
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Salt for the `hash` provider.
    #[serde(default)]
    pub seed: u64,
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
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            seed: 0,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    500
}

/// Default vector size for the `hash` provider.
pub const DEFAULT_HASH_DIMS: usize = 256;

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Verses,
    Qa,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Verses => f.write_str("verses"),
            SourceKind::Qa => f.write_str("qa"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub tag: String,
    pub kind: SourceKind,
    /// A single file or a directory scanned with the globs below.
    pub path: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Language for records that do not carry one.
    #[serde(default)]
    pub language: Option<String>,
    /// Separator between per-verse texts when a record spans a verse range.
    #[serde(default)]
    pub range_delimiter: Option<String>,
    /// Trust level stamped on Q&A records that do not carry their own.
    #[serde(default)]
    pub authority: Option<String>,
    /// Logical field name → raw key, tried before the built-in key lists.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string(), "**/*.json".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate sources
    let mut seen = HashSet::new();
    for source in &config.sources {
        if source.tag.is_empty()
            || !source
                .tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!(
                "sources.tag '{}' must be non-empty and contain only [A-Za-z0-9_]",
                source.tag
            );
        }
        if !seen.insert(source.tag.as_str()) {
            anyhow::bail!("Duplicate source tag: '{}'", source.tag);
        }
        if source.include_globs.is_empty() {
            anyhow::bail!("sources.include_globs must not be empty for '{}'", source.tag);
        }
    }

    // Validate merge
    if config.merge.scripture.trim().is_empty() {
        anyhow::bail!("merge.scripture must not be empty");
    }

    // Validate clustering
    let threshold = config.clustering.threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        anyhow::bail!("clustering.threshold must be in (0.0, 1.0], got {}", threshold);
    }
    if config.clustering.max_concurrency == 0 {
        anyhow::bail!("clustering.max_concurrency must be > 0");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "local" => {}
        "openai" | "ollama" => {
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
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, ollama, local, or disabled.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    Ok(())
}
