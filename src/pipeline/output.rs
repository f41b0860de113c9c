//! The final artifact: Category → clusters → items → content variations.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::media::Item;
use crate::types::{Assignment, Category, Cluster, ContentVariation, Description, Discovery, UNCATEGORIZED};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub name: String,
    pub rationale: String,
    pub items: Vec<String>,
    /// The label came from outside the discovered category set.
    #[serde(default)]
    pub flagged: bool,
    /// Shared by every item in the cluster.
    #[serde(default)]
    pub variations: Vec<ContentVariation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryGroup {
    pub category: String,
    pub display_name: String,
    pub clusters: Vec<ClusterEntry>,
}

impl CategoryGroup {
    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.clusters
            .iter()
            .flat_map(|c| c.items.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub categories: Vec<Category>,
    pub category_rationale: String,
    pub hook_categories: Vec<Category>,
    #[serde(default)]
    pub hook_rationale: String,
    /// In first-appearance order: image clusters, then videos.
    pub groups: Vec<CategoryGroup>,
    pub descriptions: BTreeMap<String, Description>,
}

impl PipelineOutput {
    pub fn group(&self, category: &str) -> Option<&CategoryGroup> {
        self.groups.iter().find(|g| g.category == category)
    }

    /// Discovered category by name, image categories first.
    pub fn category(&self, name: &str) -> Option<&Category> {
        self.categories
            .iter()
            .chain(&self.hook_categories)
            .find(|c| c.name == name)
    }

    /// Group and cluster holding `item_id`.
    pub fn locate(&self, item_id: &str) -> Option<(&CategoryGroup, &ClusterEntry)> {
        self.groups.iter().find_map(|g| {
            g.clusters
                .iter()
                .find(|c| c.items.iter().any(|i| i == item_id))
                .map(|c| (g, c))
        })
    }

    pub fn description(&self, item_id: &str) -> Option<&Description> {
        self.descriptions.get(item_id)
    }

    pub fn variations_for(&self, item_id: &str) -> &[ContentVariation] {
        self.locate(item_id)
            .map(|(_, c)| c.variations.as_slice())
            .unwrap_or(&[])
    }

    /// Every item id in output order.
    pub fn item_ids(&self) -> Vec<&str> {
        self.groups.iter().flat_map(CategoryGroup::item_ids).collect()
    }
}

/// Items that break the exactly-once coverage of the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageGap {
    pub missing: Vec<String>,
    pub duplicated: Vec<String>,
    pub unexpected: Vec<String>,
}

impl CoverageGap {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.duplicated.is_empty() && self.unexpected.is_empty()
    }
}

pub fn check_coverage(output: &PipelineOutput, items: &[Item]) -> CoverageGap {
    let expected: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut gap = CoverageGap::default();
    for id in output.item_ids() {
        if !expected.contains(id) {
            gap.unexpected.push(id.to_string());
        } else if !seen.insert(id) {
            gap.duplicated.push(id.to_string());
        }
    }
    gap.missing = items
        .iter()
        .filter(|i| !seen.contains(i.id.as_str()))
        .map(|i| i.id.clone())
        .collect();
    gap
}

/// Inputs to [`assemble`], all produced by earlier passes.
pub(crate) struct AssemblyInput<'a> {
    pub categories: &'a Discovery,
    pub hooks: &'a Discovery,
    pub clusters: &'a [Cluster],
    pub labels: &'a [Assignment],
    pub videos: &'a [Item],
    pub classifications: &'a [Assignment],
    pub descriptions: &'a [Description],
}

/// Video clusters are named after the file, dots replaced.
pub fn video_cluster_name(item_id: &str) -> String {
    item_id.replace('.', "_")
}

/// Group labeled clusters and classified videos by category. Anything
/// without an assignment lands in `uncategorized`. Content variations are
/// filled in afterwards.
pub(crate) fn assemble(input: AssemblyInput<'_>) -> PipelineOutput {
    let labels: HashMap<&str, &Assignment> =
        input.labels.iter().map(|a| (a.subject.as_str(), a)).collect();
    let classes: HashMap<&str, &Assignment> = input
        .classifications
        .iter()
        .map(|a| (a.subject.as_str(), a))
        .collect();

    let mut groups: Vec<CategoryGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut push = |category: &str, entry: ClusterEntry| {
        let idx = *index.entry(category.to_string()).or_insert_with(|| {
            let display_name = input
                .categories
                .categories
                .iter()
                .chain(&input.hooks.categories)
                .find(|c| c.name == category)
                .map(|c| c.display_name.clone())
                .unwrap_or_else(|| category.to_string());
            groups.push(CategoryGroup {
                category: category.to_string(),
                display_name,
                clusters: Vec::new(),
            });
            groups.len() - 1
        });
        groups[idx].clusters.push(entry);
    };

    for cluster in input.clusters {
        let (category, flagged) = match labels.get(cluster.name.as_str()) {
            Some(a) => (a.category.as_str(), a.flagged),
            None => (UNCATEGORIZED, true),
        };
        push(
            category,
            ClusterEntry {
                name: cluster.name.clone(),
                rationale: cluster.rationale.clone(),
                items: cluster.members.clone(),
                flagged,
                variations: Vec::new(),
            },
        );
    }

    for video in input.videos {
        let (category, rationale, flagged) = match classes.get(video.id.as_str()) {
            Some(a) => (a.category.as_str(), a.rationale.clone(), a.flagged),
            None => (UNCATEGORIZED, String::new(), true),
        };
        push(
            category,
            ClusterEntry {
                name: video_cluster_name(&video.id),
                rationale,
                items: vec![video.id.clone()],
                flagged,
                variations: Vec::new(),
            },
        );
    }

    PipelineOutput {
        categories: input.categories.categories.clone(),
        category_rationale: input.categories.rationale.clone(),
        hook_categories: input.hooks.categories.clone(),
        hook_rationale: input.hooks.rationale.clone(),
        groups,
        descriptions: input
            .descriptions
            .iter()
            .map(|d| (d.item_id.clone(), d.clone()))
            .collect(),
    }
}
