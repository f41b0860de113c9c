//! Records produced and consumed by the analysis passes.
//!
//! Everything here is serde-serializable because each pass output is
//! checkpointed as-is.

use serde::{Deserialize, Serialize};

use crate::media::MediaKind;

/// Synthetic group receiving items a grouping step failed to place.
pub const UNASSIGNED_GROUP: &str = "unassigned";

/// Synthetic category for clusters/videos that could not be labeled.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Structured analysis of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub item_id: String,
    pub kind: MediaKind,
    /// What is literally shown: people, products, text overlays, colours.
    pub visual_elements: String,
    pub emotional_tone: String,
    pub implied_message: String,
    /// Awareness stage the creative targets (unaware .. most-aware).
    pub awareness_stage: String,
    /// Empty for images.
    #[serde(default)]
    pub transcript_summary: String,
}

/// A discovered group label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Snake-case slug, unique within one discovery run.
    pub name: String,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub sophistication_stage: String,
    #[serde(default)]
    pub belief_mapping: String,
    #[serde(default)]
    pub example_items: Vec<String>,
}

/// Output of one discovery call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Discovery {
    pub rationale: String,
    pub categories: Vec<Category>,
}

impl Discovery {
    pub fn contains(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name.as_str()).collect()
    }
}

/// A named set of item ids judged similar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub rationale: String,
    pub members: Vec<String>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, rationale: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            name: name.into(),
            rationale: rationale.into(),
            members,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Maps a cluster or a single item onto a category.
///
/// `flagged` is set when the category is not part of the current discovered
/// set; the assignment is kept so it can be reviewed rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Cluster name or item id.
    pub subject: String,
    pub category: String,
    pub rationale: String,
    #[serde(default)]
    pub flagged: bool,
}

/// One generated text variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVariation {
    pub primary_text: String,
    pub headline: String,
    pub description: String,
}
