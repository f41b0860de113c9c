//! Unsupervised grouping of items by feature-vector similarity.
//!
//! 1. Cosine distances between L2-normalized vectors.
//! 2. Average-linkage agglomeration cut at a fixed distance threshold.
//! 3. Clusters above the size bound are re-clustered on their own
//!    sub-matrix at `threshold * split_factor`, via an explicit worklist.
//!    Past `max_split_depth` (e.g. identical vectors that never separate) an
//!    oversized cluster is cut into contiguous chunks of the maximum size.
//! 4. Each cluster is named from its members' description keywords.

pub mod linkage;
pub mod naming;

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::types::{Cluster, Description};

use linkage::{average_linkage, cosine_distance_matrix};
use naming::{describe_cluster, unique_name};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ClusterError {
    #[error("got {ids} item ids but {vectors} feature vectors")]
    LengthMismatch { ids: usize, vectors: usize },
    #[error("feature vector for {item} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        item: String,
        expected: usize,
        got: usize,
    },
    #[error("feature vector for {0} contains a non-finite value")]
    NonFinite(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub distance_threshold: f64,
    pub max_cluster_size: usize,
    pub split_factor: f64,
    pub max_split_depth: usize,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            distance_threshold: 0.35,
            max_cluster_size: 10,
            split_factor: 0.7,
            max_split_depth: 8,
        }
    }
}

impl ClusterParams {
    /// Params from `config`; `default_threshold` applies when the config
    /// leaves the distance threshold to the feature extractor.
    pub fn from_config(config: &PipelineConfig, default_threshold: f32) -> Self {
        Self {
            distance_threshold: config
                .cluster_distance_threshold
                .unwrap_or(default_threshold) as f64,
            max_cluster_size: config.max_cluster_size,
            split_factor: config.split_factor as f64,
            max_split_depth: config.max_split_depth,
        }
    }
}

struct Work {
    members: Vec<usize>,
    threshold: f64,
    depth: usize,
}

/// Partition indices `0..vectors.len()` into clusters of at most
/// `max_cluster_size`. Zero or one vector yields a single cluster.
pub fn partition(vectors: &[Vec<f32>], params: &ClusterParams) -> Vec<Vec<usize>> {
    let n = vectors.len();
    if n <= 1 {
        return vec![(0..n).collect()];
    }
    let max_size = params.max_cluster_size.max(1);
    let dist = cosine_distance_matrix(vectors);

    let mut stack: Vec<Work> = average_linkage(&dist, params.distance_threshold)
        .into_iter()
        .rev()
        .map(|members| Work {
            members,
            threshold: params.distance_threshold,
            depth: 0,
        })
        .collect();

    let mut out = Vec::new();
    while let Some(work) = stack.pop() {
        if work.members.len() <= max_size {
            out.push(work.members);
            continue;
        }
        if work.depth >= params.max_split_depth {
            warn!(
                size = work.members.len(),
                max_size,
                depth = work.depth,
                "cluster did not separate; chunking"
            );
            out.extend(work.members.chunks(max_size).map(<[usize]>::to_vec));
            continue;
        }

        let threshold = work.threshold * params.split_factor;
        let sub = dist
            .select_rows(work.members.iter())
            .select_columns(work.members.iter());
        let parts = average_linkage(&sub, threshold);
        debug!(
            size = work.members.len(),
            parts = parts.len(),
            threshold,
            depth = work.depth + 1,
            "re-clustered oversized cluster"
        );
        for part in parts.into_iter().rev() {
            stack.push(Work {
                members: part.into_iter().map(|i| work.members[i]).collect(),
                threshold,
                depth: work.depth + 1,
            });
        }
    }
    out
}

/// Local replacement for remote grouping over the whole corpus.
#[derive(Debug, Clone, Default)]
pub struct SimilarityClusterer {
    params: ClusterParams,
}

impl SimilarityClusterer {
    pub fn new(params: ClusterParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ClusterParams {
        &self.params
    }

    /// Cluster `ids` by their `vectors` (same order) and name each cluster.
    ///
    /// Every id ends up in exactly one cluster; an empty input yields no
    /// clusters.
    pub fn cluster(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        descriptions: &HashMap<String, Description>,
    ) -> Result<Vec<Cluster>, ClusterError> {
        if ids.len() != vectors.len() {
            return Err(ClusterError::LengthMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        if let Some(first) = vectors.first() {
            for (id, v) in ids.iter().zip(vectors) {
                if v.len() != first.len() {
                    return Err(ClusterError::DimensionMismatch {
                        item: id.clone(),
                        expected: first.len(),
                        got: v.len(),
                    });
                }
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(ClusterError::NonFinite(id.clone()));
                }
            }
        }

        let mut used = HashSet::new();
        let clusters = partition(vectors, &self.params)
            .into_iter()
            .filter(|members| !members.is_empty())
            .enumerate()
            .map(|(position, members)| {
                let members: Vec<String> = members.into_iter().map(|i| ids[i].clone()).collect();
                let (base, rationale) = describe_cluster(position, &members, descriptions);
                Cluster::new(unique_name(&base, &mut used), rationale, members)
            })
            .collect();
        Ok(clusters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trivial_inputs() {
        let params = ClusterParams::default();
        assert_eq!(partition(&[], &params), vec![Vec::<usize>::new()]);
        assert_eq!(partition(&[vec![1.0]], &params), vec![vec![0]]);
    }

    #[test]
    fn identical_vectors_are_chunked_to_the_bound() {
        let vectors = vec![vec![0.5, 0.5, 0.1]; 23];
        let params = ClusterParams {
            max_cluster_size: 10,
            ..ClusterParams::default()
        };
        let parts = partition(&vectors, &params);
        let sizes: Vec<usize> = parts.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(parts.concat(), (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let err = SimilarityClusterer::default()
            .cluster(&ids, &[vec![1.0, 0.0], vec![1.0]], &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ClusterError::DimensionMismatch { .. }));
    }
}
