use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use creative_harness::analyst::{
    AnalystError, ClassifyRequest, ContentRequest, CorpusEntry, CreativeAnalyst, DiscoveryDomain,
    GroupingEntry, LabelRequest, MergeBrief, Verdict,
};
use creative_harness::grouping::RemoteGrouper;
use creative_harness::media::{Item, VideoInfo};
use creative_harness::types::{Category, Cluster, ContentVariation, Description, Discovery};
use creative_harness::ConcurrencyLimiter;

/// Groups each batch badly on purpose: the last entry is left out, the first
/// is listed twice and one id that was never submitted is invented. The merge
/// answer only covers even-numbered items.
struct LossyGrouper {
    all_ids: Vec<String>,
    batch_calls: AtomicUsize,
    merge_calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    briefs: Mutex<Vec<MergeBrief>>,
}

impl LossyGrouper {
    fn new(n: usize) -> Self {
        Self {
            all_ids: (0..n).map(|i| format!("ad_{i:03}.png")).collect(),
            batch_calls: AtomicUsize::new(0),
            merge_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            briefs: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> Vec<GroupingEntry> {
        self.all_ids
            .iter()
            .map(|id| GroupingEntry {
                item_id: id.clone(),
                visual: PathBuf::from(id),
                summary: format!("summary of {id}"),
            })
            .collect()
    }
}

#[async_trait]
impl CreativeAnalyst for LossyGrouper {
    async fn describe(
        &self,
        _item: &Item,
        _video: Option<&VideoInfo>,
    ) -> Result<Description, AnalystError> {
        unreachable!("grouping only")
    }

    async fn discover_groups(
        &self,
        _domain: DiscoveryDomain,
        _corpus: &[CorpusEntry],
    ) -> Result<Discovery, AnalystError> {
        unreachable!("grouping only")
    }

    async fn classify(
        &self,
        _req: ClassifyRequest<'_>,
        _categories: &[Category],
    ) -> Result<Verdict, AnalystError> {
        unreachable!("grouping only")
    }

    async fn label_group(
        &self,
        _req: LabelRequest<'_>,
        _categories: &[Category],
    ) -> Result<Verdict, AnalystError> {
        unreachable!("grouping only")
    }

    async fn generate_content(
        &self,
        _req: ContentRequest<'_>,
    ) -> Result<Vec<ContentVariation>, AnalystError> {
        unreachable!("grouping only")
    }

    async fn group_batch(&self, batch: &[GroupingEntry]) -> Result<Vec<Cluster>, AnalystError> {
        let n = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(batch.len());
        let ids: Vec<String> = batch.iter().map(|e| e.item_id.clone()).collect();
        let kept = &ids[..ids.len().saturating_sub(1)];
        let mid = kept.len() / 2;
        Ok(vec![
            Cluster::new("lifestyle", "people", kept[..mid].to_vec()),
            Cluster::new(
                format!("product_{n}"),
                "packshots",
                kept[mid..]
                    .iter()
                    .cloned()
                    .chain([ids[0].clone(), "invented.png".to_string()])
                    .collect(),
            ),
        ])
    }

    async fn merge_groups(&self, brief: &MergeBrief) -> Result<Vec<Cluster>, AnalystError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        self.briefs.lock().unwrap().push(brief.clone());
        let evens: Vec<String> = self.all_ids.iter().step_by(2).cloned().collect();
        let (first, second) = evens.split_at(evens.len() / 2);
        Ok(vec![
            Cluster::new("lifestyle", "merged", first.to_vec()),
            Cluster::new("lifestyle", "same name again", second.to_vec()),
            Cluster::new("ghosts", "nothing real", vec!["nope.png".into()]),
        ])
    }
}

#[tokio::test]
async fn forty_seven_items_in_batches_of_twenty_merge_into_exact_partition() {
    let analyst = Arc::new(LossyGrouper::new(47));
    let grouper = RemoteGrouper::new(analyst.clone(), ConcurrencyLimiter::new(4))
        .with_batch_size(NonZeroUsize::new(20).unwrap());

    let entries = analyst.entries();
    let groups = grouper.group("global", &entries).await.unwrap();

    assert_eq!(analyst.batch_calls.load(Ordering::SeqCst), 3);
    let mut sizes = analyst.batch_sizes.lock().unwrap().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![7, 20, 20]);
    assert_eq!(analyst.merge_calls.load(Ordering::SeqCst), 1);

    let brief = analyst.briefs.lock().unwrap()[0].clone();
    assert_eq!(brief.batches, 3);
    assert_eq!(brief.total_items, 47);
    assert!(brief.text.contains("## Batch 3"));
    assert!(!brief.text.contains("invented.png"));

    let members: Vec<&str> = groups
        .iter()
        .flat_map(|g| g.members.iter().map(String::as_str))
        .collect();
    assert_eq!(members.len(), 47);
    let unique: HashSet<&str> = members.iter().copied().collect();
    assert_eq!(unique.len(), 47);
    for id in &analyst.all_ids {
        assert!(unique.contains(id.as_str()), "{id} missing");
    }

    let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["lifestyle", "lifestyle_2", "unassigned"]);
    assert!(groups.iter().all(|g| !g.members.is_empty()));
}

#[tokio::test]
async fn single_batch_skips_the_merge_call() {
    let analyst = Arc::new(LossyGrouper::new(12));
    let grouper = RemoteGrouper::new(analyst.clone(), ConcurrencyLimiter::new(2))
        .with_batch_size(NonZeroUsize::new(20).unwrap());

    let groups = grouper.group("category:proof", &analyst.entries()).await.unwrap();

    assert_eq!(analyst.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(analyst.merge_calls.load(Ordering::SeqCst), 0);
    let total: usize = groups.iter().map(Cluster::len).sum();
    assert_eq!(total, 12);
    // The dropped last entry is recovered into the synthetic group.
    let unassigned = groups.iter().find(|g| g.name == "unassigned").unwrap();
    assert_eq!(unassigned.members, vec!["ad_011.png".to_string()]);
}

#[tokio::test]
async fn empty_input_makes_no_calls() {
    let analyst = Arc::new(LossyGrouper::new(0));
    let grouper = RemoteGrouper::new(analyst.clone(), ConcurrencyLimiter::new(2));

    let groups = grouper.group("global", &[]).await.unwrap();

    assert!(groups.is_empty());
    assert_eq!(analyst.batch_calls.load(Ordering::SeqCst), 0);
}
