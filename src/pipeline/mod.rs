//! Checkpointed pass graph.
//!
//! Passes run strictly in order:
//!
//! ```text
//! Scan → Preprocess → Describe → Cluster → DiscoverCategories → DiscoverHooks
//!      → LabelClusters → ClassifyVideos → GenerateContent
//! ```
//!
//! Every pass after Scan checks the [`CheckpointStore`] first and only
//! computes when no checkpoint matches its input fingerprint (or the pass is
//! forced). Fingerprints hash the digests of the artifacts a pass consumed,
//! so a recomputed upstream artifact invalidates everything downstream of
//! it. A failed pass aborts the run; re-running resumes from the last
//! checkpoint.

pub mod output;
mod passes;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyst::{AnalystError, CreativeAnalyst, LlmAnalyst};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::clustering::ClusterError;
use crate::config::{ConfigError, FeatureBackend, PipelineConfig};
use crate::features::{
    ClipFeatureExtractor, FeatureCache, FeatureError, FeatureExtractor, ThumbnailFeatureExtractor,
};
use crate::gateway::openrouter::OpenRouterAdapter;
use crate::gateway::{ProviderError, ProviderGateway, TracingUsageSink};
use crate::grouping::GroupingError;
use crate::limiter::{CancelHandle, Cancelled};
use crate::media::{MediaError, MediaKind};
use crate::preprocess::{PreprocessError, VideoPreprocessor};

pub use output::{check_coverage, CategoryGroup, ClusterEntry, CoverageGap, PipelineOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassId {
    Scan,
    Preprocess,
    Describe,
    Cluster,
    DiscoverCategories,
    DiscoverHooks,
    LabelClusters,
    ClassifyVideos,
    GenerateContent,
}

impl PassId {
    pub const ALL: [PassId; 9] = [
        PassId::Scan,
        PassId::Preprocess,
        PassId::Describe,
        PassId::Cluster,
        PassId::DiscoverCategories,
        PassId::DiscoverHooks,
        PassId::LabelClusters,
        PassId::ClassifyVideos,
        PassId::GenerateContent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Preprocess => "preprocess",
            Self::Describe => "describe",
            Self::Cluster => "cluster",
            Self::DiscoverCategories => "discover_categories",
            Self::DiscoverHooks => "discover_hooks",
            Self::LabelClusters => "label_clusters",
            Self::ClassifyVideos => "classify_videos",
            Self::GenerateContent => "generate_content",
        }
    }

    /// Checkpoint file stem. Scan is always recomputed and has none.
    pub fn checkpoint_name(self) -> Option<&'static str> {
        match self {
            Self::Scan => None,
            Self::Preprocess => Some("video_preprocessed"),
            Self::Describe => Some("descriptions"),
            Self::Cluster => Some("global_clusters"),
            Self::DiscoverCategories => Some("categories"),
            Self::DiscoverHooks => Some("video_categories"),
            Self::LabelClusters => Some("cluster_labels"),
            Self::ClassifyVideos => Some("video_classifications"),
            Self::GenerateContent => Some("output"),
        }
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What went wrong inside a pass.
#[derive(Debug, thiserror::Error)]
pub enum PassFailure {
    #[error(transparent)]
    Analyst(#[from] AnalystError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("{failed} of {total} items failed; first error: {first}")]
    Items {
        failed: usize,
        total: usize,
        first: Box<PassFailure>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("media error: {0}")]
    Media(#[from] MediaError),
    #[error("provider setup error: {0}")]
    Provider(#[from] ProviderError),
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{videos} videos found but no video preprocessor is configured")]
    MissingPreprocessor { videos: usize },
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("{pass} pass failed: {source}")]
    Pass {
        pass: PassId,
        #[source]
        source: PassFailure,
    },
    #[error("run cancelled during {pass}")]
    Cancelled { pass: PassId },
    #[error("output coverage violated: {0:?}")]
    Coverage(CoverageGap),
    #[error("run stopped after {stopped_after}; no final output")]
    Incomplete { stopped_after: PassId },
}

impl PipelineError {
    pub(crate) fn pass(pass: PassId, source: impl Into<PassFailure>) -> Self {
        Self::Pass {
            pass,
            source: source.into(),
        }
    }

    pub(crate) fn grouping(pass: PassId, err: GroupingError) -> Self {
        match err {
            GroupingError::Analyst(e) => Self::pass(pass, e),
            GroupingError::Cancelled(Cancelled) => Self::Cancelled { pass },
        }
    }

    /// The pass that failed, when the failure happened inside one.
    pub fn failed_pass(&self) -> Option<PassId> {
        match self {
            Self::Pass { pass, .. } | Self::Cancelled { pass } => Some(*pass),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    /// Read back from a matching checkpoint.
    Loaded,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass: PassId,
    pub status: PassStatus,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub passes: Vec<PassRecord>,
    /// Present when the run reached GenerateContent.
    pub output: Option<PipelineOutput>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            passes: Vec::new(),
            output: None,
        }
    }

    pub fn status(&self, pass: PassId) -> Option<PassStatus> {
        self.passes.iter().find(|r| r.pass == pass).map(|r| r.status)
    }

    pub fn computed(&self) -> Vec<PassId> {
        self.with_status(PassStatus::Computed)
    }

    pub fn loaded(&self) -> Vec<PassId> {
        self.with_status(PassStatus::Loaded)
    }

    fn with_status(&self, status: PassStatus) -> Vec<PassId> {
        self.passes
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.pass)
            .collect()
    }
}

/// A pass output together with the digest of its checkpointed form.
#[derive(Debug, Clone)]
pub(crate) struct Artifact<T> {
    pub value: T,
    pub digest: String,
}

/// Extractor for `config.feature_backend`. CLIP weights load lazily, on the
/// first similarity clustering.
fn default_extractor(config: &PipelineConfig) -> Arc<dyn FeatureExtractor> {
    match config.feature_backend {
        FeatureBackend::Clip => match &config.clip_weights_path {
            Some(path) => Arc::new(ClipFeatureExtractor::from_file(path.clone())),
            None => Arc::new(ClipFeatureExtractor::from_hub(&config.clip_model)),
        },
        FeatureBackend::Thumbnail => Arc::new(ThumbnailFeatureExtractor::default()),
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    analyst: Arc<dyn CreativeAnalyst>,
    preprocessor: Option<Arc<dyn VideoPreprocessor>>,
    extractor: Arc<dyn FeatureExtractor>,
    feature_cache: Option<Arc<dyn FeatureCache>>,
    /// Identifies analyst settings invisible to the config (brand context),
    /// mixed into every remote pass fingerprint.
    analyst_tag: String,
    cancel: CancelHandle,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, analyst: Arc<dyn CreativeAnalyst>) -> Result<Self, PipelineError> {
        config.validate()?;
        let extractor = default_extractor(&config);
        Ok(Self {
            config,
            analyst,
            preprocessor: None,
            extractor,
            feature_cache: None,
            analyst_tag: String::new(),
            cancel: CancelHandle::new(),
        })
    }

    /// Pipeline over an OpenRouter-backed [`LlmAnalyst`]. Fails when the
    /// credentials or the brand context file are missing.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let gateway = ProviderGateway::with_config(
            OpenRouterAdapter::from_env()?,
            Arc::new(TracingUsageSink),
            config.gateway_config(),
        );
        let mut analyst = LlmAnalyst::new(Arc::new(gateway), config.model.clone())
            .with_transcript_chars(config.transcript_chars);
        let mut tag = String::new();
        if let Some(path) = &config.brand_context_path {
            let context = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
                path: path.clone(),
                source,
            })?;
            tag = blake3::hash(context.as_bytes()).to_hex().to_string();
            analyst = analyst.with_brand_context(context);
        }
        Ok(Self::new(config, Arc::new(analyst))?.with_analyst_tag(tag))
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn VideoPreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_feature_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Defaults to a SQLite cache at `config.feature_cache_path()`, opened
    /// on first use.
    pub fn with_feature_cache(mut self, cache: Arc<dyn FeatureCache>) -> Self {
        self.feature_cache = Some(cache);
        self
    }

    pub fn with_analyst_tag(mut self, tag: impl Into<String>) -> Self {
        self.analyst_tag = tag.into();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Cancelling stops new work from starting; in-flight calls finish and
    /// the current pass then fails with [`PipelineError::Cancelled`].
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run every pass and return the final artifact.
    pub async fn run(&self) -> Result<PipelineOutput, PipelineError> {
        let report = self.run_until(PassId::GenerateContent).await?;
        report.output.ok_or(PipelineError::Incomplete {
            stopped_after: PassId::GenerateContent,
        })
    }

    /// Run passes up to and including `stop`.
    pub async fn run_until(&self, stop: PassId) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new();
        let store = CheckpointStore::new(self.config.checkpoint_dir())?;
        let _lock = store.lock_exclusive()?;
        info!(
            run_id = %report.run_id,
            input = %self.config.input_dir.display(),
            stop = %stop,
            "pipeline run starting"
        );

        let started = Instant::now();
        let items = crate::media::scan_media(&self.config.input_dir)?;
        let videos = items.iter().filter(|i| i.kind == MediaKind::Video).count();
        if videos > 0 && self.preprocessor.is_none() {
            return Err(PipelineError::MissingPreprocessor { videos });
        }
        info!(
            items = items.len(),
            images = items.len() - videos,
            videos,
            "scanned input"
        );
        report.passes.push(PassRecord {
            pass: PassId::Scan,
            status: PassStatus::Computed,
            elapsed: started.elapsed(),
        });

        let mut run = passes::Run { store, report };
        let finished = self.drive(&mut run, &items, stop).await;
        let report = run.report;
        match finished {
            Ok(()) => {
                info!(
                    run_id = %report.run_id,
                    computed = report.computed().len(),
                    loaded = report.loaded().len(),
                    "pipeline run finished"
                );
                Ok(report)
            }
            Err(err) => {
                warn!(run_id = %report.run_id, error = %err, "pipeline run failed");
                Err(err)
            }
        }
    }

    /// Load the checkpoint for `pass` or compute and persist it.
    pub(crate) async fn checkpointed<T, F, Fut>(
        &self,
        run: &mut passes::Run,
        pass: PassId,
        fingerprint: String,
        compute: F,
    ) -> Result<Artifact<T>, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let name = pass.checkpoint_name().unwrap_or(pass.as_str());
        let started = Instant::now();
        if self.config.is_forced(pass) {
            info!(pass = %pass, "pass forced; ignoring checkpoint");
        } else if let Some(loaded) = run.store.load::<T>(name, &fingerprint).await? {
            info!(pass = %pass, "loaded from checkpoint");
            run.record(pass, PassStatus::Loaded, started);
            return Ok(Artifact {
                value: loaded.value,
                digest: loaded.digest,
            });
        }

        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { pass });
        }
        info!(pass = %pass, "computing pass");
        let value = compute().await?;
        let digest = run.store.save(name, &fingerprint, &value).await?;
        run.record(pass, PassStatus::Computed, started);
        info!(
            pass = %pass,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pass complete"
        );
        Ok(Artifact { value, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_order_and_names() {
        let mut sorted = PassId::ALL;
        sorted.sort();
        assert_eq!(sorted, PassId::ALL);
        assert_eq!(PassId::Scan.checkpoint_name(), None);
        assert_eq!(PassId::Cluster.checkpoint_name(), Some("global_clusters"));
        assert_eq!(PassId::DiscoverHooks.checkpoint_name(), Some("video_categories"));
        assert_eq!(
            serde_json::to_string(&PassId::LabelClusters).unwrap(),
            "\"label_clusters\""
        );
    }

    #[test]
    fn feature_backend_picks_extractor_and_threshold() {
        let clip = default_extractor(&PipelineConfig::default());
        assert_eq!(clip.id(), "clip-openai_clip-vit-base-patch32-v1");
        assert_eq!(clip.distance_threshold(), crate::features::CLIP_DISTANCE_THRESHOLD);

        let local = default_extractor(&PipelineConfig {
            clip_weights_path: Some("/models/vit-b32.safetensors".into()),
            ..PipelineConfig::default()
        });
        assert_eq!(local.id(), "clip-file-vit-b32-v1");

        let thumb = default_extractor(&PipelineConfig {
            feature_backend: FeatureBackend::Thumbnail,
            ..PipelineConfig::default()
        });
        assert!(thumb.id().starts_with("thumb-"));
        assert_eq!(
            thumb.distance_threshold(),
            crate::features::THUMBNAIL_DISTANCE_THRESHOLD
        );
    }

    #[test]
    fn every_checkpoint_name_is_distinct() {
        let mut names: Vec<&str> = PassId::ALL.iter().filter_map(|p| p.checkpoint_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PassId::ALL.len() - 1);
    }
}
