#![forbid(unsafe_code)]

//! # creative-harness
//!
//! Classifies a folder of ad creatives (images and videos) into strategically
//! discovered categories and writes content per group.
//!
//! The work is a fixed chain of passes (describe, cluster, discover, label,
//! generate), each checkpointed so an interrupted run resumes where it
//! stopped. Remote model calls go through a bounded-concurrency limiter with
//! exponential-backoff retries; oversized grouping jobs are split into
//! batches and merged back into one exact partition; the high-volume global
//! grouping runs locally as average-linkage clustering over CLIP image
//! embeddings.

pub mod analyst;
pub mod batching;
pub mod checkpoint;
pub mod clustering;
pub mod config;
pub mod features;
pub mod gateway;
pub mod grouping;
pub mod limiter;
pub mod media;
pub mod merge;
pub mod pipeline;
pub mod preprocess;
pub mod prompts;
pub mod types;

pub use analyst::{AnalystError, CreativeAnalyst, DiscoveryDomain, LlmAnalyst};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use clustering::{ClusterParams, SimilarityClusterer};
pub use config::{ContentMode, FeatureBackend, GroupingStrategy, PipelineConfig};
pub use features::{
    ClipFeatureExtractor, FeatureExtractor, SqliteFeatureCache, ThumbnailFeatureExtractor,
};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use limiter::{CancelHandle, ConcurrencyLimiter};
pub use media::{Item, MediaKind, VideoInfo};
pub use merge::{reconcile_partition, MergeReconciler};
pub use pipeline::{PassId, Pipeline, PipelineError, PipelineOutput, RunReport};
pub use preprocess::{PreprocessError, VideoPreprocessor};
pub use types::{Assignment, Category, Cluster, ContentVariation, Description, Discovery};
