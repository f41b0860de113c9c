//! Remote grouping of arbitrarily many items through bounded batches.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tracing::info;

use crate::analyst::{AnalystError, CreativeAnalyst, GroupingEntry};
use crate::batching::split_batches;
use crate::limiter::{Cancelled, ConcurrencyLimiter};
use crate::merge::{log_report, reconcile_partition, MergeReconciler};
use crate::types::Cluster;

/// Default ceiling for whole-corpus grouping calls (image payloads).
pub const GLOBAL_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(8) {
    Some(n) => n,
    None => unreachable!(),
};

/// Default ceiling for grouping calls scoped to one category.
pub const CATEGORY_BATCH_SIZE: NonZeroUsize = match NonZeroUsize::new(20) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug, thiserror::Error)]
pub enum GroupingError {
    #[error(transparent)]
    Analyst(#[from] AnalystError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Splits the item set into batches, groups each batch remotely under the
/// shared limiter, then merges the batch results.
pub struct RemoteGrouper {
    analyst: Arc<dyn CreativeAnalyst>,
    limiter: ConcurrencyLimiter,
    batch_size: NonZeroUsize,
}

impl RemoteGrouper {
    pub fn new(analyst: Arc<dyn CreativeAnalyst>, limiter: ConcurrencyLimiter) -> Self {
        Self {
            analyst,
            limiter,
            batch_size: GLOBAL_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: NonZeroUsize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Group `entries` into a partition covering every entry exactly once.
    pub async fn group(
        &self,
        scope: &str,
        entries: &[GroupingEntry],
    ) -> Result<Vec<Cluster>, GroupingError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let batches = split_batches(entries, self.batch_size);
        info!(
            scope,
            items = entries.len(),
            batches = batches.len(),
            batch_size = self.batch_size.get(),
            "grouping batches"
        );

        let analyst = self.analyst.as_ref();
        let results = self
            .limiter
            .run_all(batches.iter().map(|batch| analyst.group_batch(batch)))
            .await;

        let mut batch_groups = Vec::with_capacity(results.len());
        for (batch, result) in batches.iter().zip(results) {
            let groups = result??;
            let batch_ids: Vec<String> = batch.iter().map(|e| e.item_id.clone()).collect();
            let (groups, report) = reconcile_partition(&batch_ids, groups);
            log_report(scope, &report);
            batch_groups.push(groups);
        }

        let expected: Vec<String> = entries.iter().map(|e| e.item_id.clone()).collect();
        let merged = MergeReconciler::new(analyst)
            .merge(scope, batch_groups, &expected)
            .await?;
        Ok(merged)
    }
}
