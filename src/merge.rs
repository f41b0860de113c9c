//! Reconciling sibling batch groupings into one exact partition.
//!
//! The merge judgment itself (which groups across batches describe the same
//! pattern) is delegated to one text-only remote call. Whatever comes back is
//! then forced into a complete partition of the expected ids:
//! - members outside the expected set are dropped,
//! - an id listed twice stays in its first group only,
//! - groups left empty are removed,
//! - ids nobody listed go to the synthetic `unassigned` group,
//! - repeated group names get a numeric suffix.

use std::collections::HashSet;

use tracing::warn;

use crate::analyst::{AnalystError, CreativeAnalyst, MergeBrief};
use crate::clustering::naming::unique_name;
use crate::types::{Cluster, UNASSIGNED_GROUP};

const MERGE_TOKENS_PER_ITEM: usize = 80;
const MERGE_MIN_TOKENS: usize = 8_192;
const MERGE_MAX_TOKENS: usize = 16_384;

/// Corrections applied by [`reconcile_partition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionReport {
    pub duplicates: usize,
    pub unknown: usize,
    pub empty_groups: usize,
    pub unassigned: usize,
    pub renamed: usize,
}

impl PartitionReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Force `groups` into a partition of exactly `expected`.
pub fn reconcile_partition(
    expected: &[String],
    groups: Vec<Cluster>,
) -> (Vec<Cluster>, PartitionReport) {
    let expected_set: HashSet<&str> = expected.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::with_capacity(expected.len());
    let mut used_names: HashSet<String> = HashSet::new();
    let mut report = PartitionReport::default();
    let mut out: Vec<Cluster> = Vec::with_capacity(groups.len() + 1);

    for group in groups {
        let mut members = Vec::with_capacity(group.members.len());
        for member in group.members {
            if !expected_set.contains(member.as_str()) {
                report.unknown += 1;
            } else if !seen.insert(member.clone()) {
                report.duplicates += 1;
            } else {
                members.push(member);
            }
        }
        if members.is_empty() {
            report.empty_groups += 1;
            continue;
        }
        let name = unique_name(&group.name, &mut used_names);
        if name != group.name {
            report.renamed += 1;
        }
        out.push(Cluster::new(name, group.rationale, members));
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        report.unassigned = missing.len();
        let name = unique_name(UNASSIGNED_GROUP, &mut used_names);
        out.push(Cluster::new(
            name,
            "Items not assigned by the grouping step",
            missing,
        ));
    }

    (out, report)
}

/// Output budget for a merge over `total_items` items.
pub fn merge_budget(total_items: usize) -> u32 {
    (total_items * MERGE_TOKENS_PER_ITEM).clamp(MERGE_MIN_TOKENS, MERGE_MAX_TOKENS) as u32
}

/// Text rendering of every batch's groups: name, rationale, members.
pub fn render_brief(batches: &[Vec<Cluster>]) -> String {
    let mut out = String::new();
    for (idx, groups) in batches.iter().enumerate() {
        out.push_str(&format!("## Batch {}\n", idx + 1));
        for group in groups {
            out.push_str(&format!(
                "- **{}**: {}\n  Items: {}\n",
                group.name,
                group.rationale,
                group.members.join(", ")
            ));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

pub(crate) fn log_report(scope: &str, report: &PartitionReport) {
    if report.is_clean() {
        return;
    }
    warn!(
        scope,
        duplicates = report.duplicates,
        unknown = report.unknown,
        empty_groups = report.empty_groups,
        unassigned = report.unassigned,
        renamed = report.renamed,
        "corrected grouping partition"
    );
}

pub struct MergeReconciler<'a> {
    analyst: &'a dyn CreativeAnalyst,
}

impl<'a> MergeReconciler<'a> {
    pub fn new(analyst: &'a dyn CreativeAnalyst) -> Self {
        Self { analyst }
    }

    /// Merge sibling batch results over disjoint subsets of `expected`.
    ///
    /// A single batch needs no merge call.
    pub async fn merge(
        &self,
        scope: &str,
        batches: Vec<Vec<Cluster>>,
        expected: &[String],
    ) -> Result<Vec<Cluster>, AnalystError> {
        let proposed = if batches.len() <= 1 {
            batches.into_iter().flatten().collect()
        } else {
            let brief = MergeBrief {
                scope: scope.to_string(),
                batches: batches.len(),
                text: render_brief(&batches),
                total_items: expected.len(),
                max_output_tokens: merge_budget(expected.len()),
            };
            self.analyst.merge_groups(&brief).await?
        };

        let (groups, report) = reconcile_partition(expected, proposed);
        log_report(scope, &report);
        Ok(groups)
    }
}
