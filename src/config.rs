//! Pipeline configuration: serde defaults, JSON file loading, env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::{GatewayConfig, RetryPolicy};
use crate::pipeline::PassId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the global Cluster pass groups images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Local agglomerative clustering over image feature vectors.
    #[default]
    Similarity,
    /// Remote grouping calls over bounded batches, reconciled by a merge call.
    Remote,
}

/// Feature extractor behind similarity clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureBackend {
    /// CLIP ViT-B/32 image embeddings.
    #[default]
    Clip,
    /// Pixel-grid and palette vectors; no model weights needed.
    Thumbnail,
}

/// Granularity of the GenerateContent pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// One call per category; its variations are shared by all its clusters.
    #[default]
    PerCategory,
    /// One call per cluster.
    PerCluster,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// OpenRouter model id used for every remote call.
    #[serde(default = "default_model")]
    pub model: String,

    /// Simultaneous remote calls within a pass.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Total attempts per remote call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default)]
    pub grouping: GroupingStrategy,
    #[serde(default)]
    pub feature_backend: FeatureBackend,
    /// HuggingFace model id for the CLIP backend.
    #[serde(default = "default_clip_model")]
    pub clip_model: String,
    /// Local CLIP weights; skips the hub download when set.
    #[serde(default)]
    pub clip_weights_path: Option<PathBuf>,
    /// Cosine-distance cut; unset means the feature extractor's own default.
    #[serde(default)]
    pub cluster_distance_threshold: Option<f32>,
    #[serde(default = "default_max_cluster_size")]
    pub max_cluster_size: usize,
    /// Threshold multiplier applied when re-clustering an oversized cluster.
    #[serde(default = "default_split_factor")]
    pub split_factor: f32,
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: usize,
    /// Ceiling for grouping calls scoped to one category.
    #[serde(default = "default_category_batch_size")]
    pub category_batch_size: usize,
    /// Ceiling for grouping calls over the whole corpus.
    #[serde(default = "default_global_batch_size")]
    pub global_batch_size: usize,
    /// SQLite feature cache; defaults to `<output_dir>/feature_cache.sqlite`.
    #[serde(default)]
    pub feature_cache_path: Option<PathBuf>,

    /// Plain-text brand background appended to every system prompt.
    #[serde(default)]
    pub brand_context_path: Option<PathBuf>,

    #[serde(default)]
    pub content_mode: ContentMode,
    #[serde(default = "default_variations")]
    pub variations_per_group: usize,
    #[serde(default = "default_label_representatives")]
    pub label_representatives: usize,
    #[serde(default = "default_content_representatives")]
    pub content_representatives: usize,
    #[serde(default = "default_hook_excerpt_chars")]
    pub hook_excerpt_chars: usize,
    #[serde(default = "default_transcript_chars")]
    pub transcript_chars: usize,

    /// Worker slots for local work: video preprocessing and feature
    /// extraction.
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
    #[serde(default = "default_preprocess_timeout_secs")]
    pub preprocess_timeout_secs: u64,
    #[serde(default = "default_preprocess_poll_secs")]
    pub preprocess_poll_secs: u64,

    /// Recompute every pass, ignoring checkpoints.
    #[serde(default)]
    pub force: bool,
    /// Recompute only these passes (downstream passes follow via fingerprints).
    #[serde(default)]
    pub force_passes: Vec<PassId>,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("creatives")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2_000
}

fn default_clip_model() -> String {
    crate::features::clip::DEFAULT_CLIP_MODEL.to_string()
}

fn default_max_cluster_size() -> usize {
    10
}

fn default_split_factor() -> f32 {
    0.7
}

fn default_max_split_depth() -> usize {
    8
}

fn default_category_batch_size() -> usize {
    20
}

fn default_global_batch_size() -> usize {
    8
}

fn default_variations() -> usize {
    5
}

fn default_label_representatives() -> usize {
    4
}

fn default_content_representatives() -> usize {
    6
}

fn default_hook_excerpt_chars() -> usize {
    200
}

fn default_transcript_chars() -> usize {
    3_000
}

fn default_local_workers() -> usize {
    2
}

fn default_preprocess_timeout_secs() -> u64 {
    600
}

fn default_preprocess_poll_secs() -> u64 {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            model: default_model(),
            max_concurrent: default_max_concurrent(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            grouping: GroupingStrategy::default(),
            feature_backend: FeatureBackend::default(),
            clip_model: default_clip_model(),
            clip_weights_path: None,
            cluster_distance_threshold: None,
            max_cluster_size: default_max_cluster_size(),
            split_factor: default_split_factor(),
            max_split_depth: default_max_split_depth(),
            category_batch_size: default_category_batch_size(),
            global_batch_size: default_global_batch_size(),
            feature_cache_path: None,
            brand_context_path: None,
            content_mode: ContentMode::default(),
            variations_per_group: default_variations(),
            label_representatives: default_label_representatives(),
            content_representatives: default_content_representatives(),
            hook_excerpt_chars: default_hook_excerpt_chars(),
            transcript_chars: default_transcript_chars(),
            local_workers: default_local_workers(),
            preprocess_timeout_secs: default_preprocess_timeout_secs(),
            preprocess_poll_secs: default_preprocess_poll_secs(),
            force: false,
            force_passes: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(v) = std::env::var("CREATIVE_INPUT_DIR") {
            self.input_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CREATIVE_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CREATIVE_MODEL") {
            self.model = v;
        }
        if let Some(v) = parse_env("MAX_CONCURRENT")? {
            self.max_concurrent = v;
        }
        if let Some(v) = parse_env("CLUSTER_DISTANCE_THRESHOLD")? {
            self.cluster_distance_threshold = Some(v);
        }
        if let Some(v) = parse_env("MAX_CLUSTER_SIZE")? {
            self.max_cluster_size = v;
        }
        if let Ok(v) = std::env::var("CREATIVE_FORCE") {
            self.force = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.max_concurrent == 0 {
            return invalid("max_concurrent must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.category_batch_size == 0 || self.global_batch_size == 0 {
            return invalid("batch sizes must be at least 1");
        }
        if self.max_cluster_size == 0 {
            return invalid("max_cluster_size must be at least 1");
        }
        if let Some(t) = self.cluster_distance_threshold {
            if !(t > 0.0 && t <= 2.0) {
                return invalid("cluster_distance_threshold must be in (0, 2]");
            }
        }
        if self.feature_backend == FeatureBackend::Clip
            && self.clip_weights_path.is_none()
            && self.clip_model.trim().is_empty()
        {
            return invalid("clip_model must not be empty");
        }
        if !(self.split_factor > 0.0 && self.split_factor < 1.0) {
            return invalid("split_factor must be in (0, 1)");
        }
        if self.variations_per_group == 0 {
            return invalid("variations_per_group must be at least 1");
        }
        if self.label_representatives == 0 || self.content_representatives == 0 {
            return invalid("representative counts must be at least 1");
        }
        if self.local_workers == 0 {
            return invalid("local_workers must be at least 1");
        }
        if self.model.trim().is_empty() {
            return invalid("model must not be empty");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_attempts: self.max_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output_dir.join("checkpoints")
    }

    pub fn feature_cache_path(&self) -> PathBuf {
        self.feature_cache_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("feature_cache.sqlite"))
    }

    pub fn preprocess_timeout(&self) -> Duration {
        Duration::from_secs(self.preprocess_timeout_secs)
    }

    pub fn preprocess_poll_interval(&self) -> Duration {
        Duration::from_secs(self.preprocess_poll_secs.max(1))
    }

    pub fn is_forced(&self, pass: PassId) -> bool {
        self.force || self.force_passes.contains(&pass)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value }),
        Err(_) => Ok(None),
    }
}
