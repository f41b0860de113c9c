//! The remote analysis operations the passes depend on.
//!
//! [`CreativeAnalyst`] is the seam between orchestration and the remote
//! model: every operation takes typed input and returns typed output.
//! [`LlmAnalyst`] implements it over a [`crate::gateway::ChatGateway`];
//! tests substitute deterministic fakes.

mod llm;
pub(crate) mod structured;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::ProviderError;
use crate::media::{Item, VideoInfo};
use crate::types::{Category, Cluster, ContentVariation, Description, Discovery};

pub use llm::LlmAnalyst;

#[derive(Debug, thiserror::Error)]
pub enum AnalystError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("{caller}: could not parse structured output: {message}")]
    Parse {
        caller: &'static str,
        message: String,
    },
    #[error("{caller}: output truncated at the token ceiling ({output_tokens} tokens, max {max_tokens:?})")]
    OutputExhausted {
        caller: &'static str,
        max_tokens: Option<u32>,
        output_tokens: u32,
    },
    #[error("could not read media {path}: {source}")]
    Media {
        path: PathBuf,
        source: std::io::Error,
    },
}

// =============================================================================
// Discovery domains
// =============================================================================

/// Which corpus a discovery call groups. Both share one prompt shape and
/// differ only in instructions, target range and output budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryDomain {
    /// Strategic concept categories over image descriptions.
    CreativeConcepts,
    /// Opening-hook categories over video descriptions and transcripts.
    VideoHooks,
}

impl DiscoveryDomain {
    pub fn target_range(self) -> (usize, usize) {
        match self {
            Self::CreativeConcepts => (6, 12),
            Self::VideoHooks => (2, 5),
        }
    }

    pub fn max_output_tokens(self) -> u32 {
        match self {
            Self::CreativeConcepts => 16_384,
            Self::VideoHooks => 8_192,
        }
    }

    pub fn instructions(self) -> &'static str {
        match self {
            Self::CreativeConcepts => {
                "Discover the strategic concept categories these creatives fall into. Map each category to a market sophistication stage and to the belief it builds. Be granular: no single category should hold more than a fifth of the creatives."
            }
            Self::VideoHooks => {
                "These are videos. Discover categories by the type of opening hook (the first seconds, given as the hook excerpt): how each video earns attention before the pitch."
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreativeConcepts => "creative_concepts",
            Self::VideoHooks => "video_hooks",
        }
    }
}

// =============================================================================
// Operation inputs/outputs
// =============================================================================

/// One creative as it appears in a discovery corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub item_id: String,
    /// Pre-rendered description text.
    pub text: String,
}

/// A category pick for a cluster or a single item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub category: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct ClassifyRequest<'a> {
    pub item_id: &'a str,
    /// Thumbnail sent alongside the text, if any.
    pub visual: Option<PathBuf>,
    /// Opening of the transcript, already truncated.
    pub hook_excerpt: String,
    pub description: Option<&'a Description>,
}

#[derive(Debug, Clone)]
pub struct LabelRequest<'a> {
    pub cluster: &'a Cluster,
    /// Representative visuals, already capped.
    pub visuals: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ContentRequest<'a> {
    /// Category or cluster name the content is for.
    pub group: &'a str,
    pub category: Option<&'a Category>,
    pub descriptions: Vec<&'a Description>,
    pub visuals: Vec<PathBuf>,
    pub variations: usize,
}

/// One creative submitted to a remote grouping call.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupingEntry {
    pub item_id: String,
    pub visual: PathBuf,
    pub summary: String,
}

/// Text-only input to the merge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeBrief {
    /// Human label for what is being merged, e.g. "All 47".
    pub scope: String,
    pub batches: usize,
    /// Rendered "## Batch N" sections.
    pub text: String,
    pub total_items: usize,
    pub max_output_tokens: u32,
}

#[async_trait]
pub trait CreativeAnalyst: Send + Sync {
    /// Structured description of one item. Videos come with their
    /// preprocessed frames and transcript.
    async fn describe(
        &self,
        item: &Item,
        video: Option<&VideoInfo>,
    ) -> Result<Description, AnalystError>;

    /// Discover mutually exclusive groups over a text corpus.
    async fn discover_groups(
        &self,
        domain: DiscoveryDomain,
        corpus: &[CorpusEntry],
    ) -> Result<Discovery, AnalystError>;

    /// Put one item into one of `categories`.
    async fn classify(
        &self,
        req: ClassifyRequest<'_>,
        categories: &[Category],
    ) -> Result<Verdict, AnalystError>;

    /// Put a whole cluster into one of `categories`.
    async fn label_group(
        &self,
        req: LabelRequest<'_>,
        categories: &[Category],
    ) -> Result<Verdict, AnalystError>;

    async fn generate_content(
        &self,
        req: ContentRequest<'_>,
    ) -> Result<Vec<ContentVariation>, AnalystError>;

    /// Group one bounded batch of creatives.
    async fn group_batch(&self, batch: &[GroupingEntry]) -> Result<Vec<Cluster>, AnalystError>;

    /// Reconcile sibling batch groupings into one partition.
    async fn merge_groups(&self, brief: &MergeBrief) -> Result<Vec<Cluster>, AnalystError>;
}
