//! Bodies of the individual passes.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::analyst::{
    ClassifyRequest, ContentRequest, CorpusEntry, DiscoveryDomain, GroupingEntry, LabelRequest,
    Verdict,
};
use crate::checkpoint::{fingerprint, write_atomic, CheckpointError, CheckpointStore};
use crate::clustering::{ClusterParams, SimilarityClusterer};
use crate::config::{ContentMode, GroupingStrategy};
use crate::features::{compute_features, FeatureCache, FeatureError, SqliteFeatureCache};
use crate::grouping::{RemoteGrouper, CATEGORY_BATCH_SIZE, GLOBAL_BATCH_SIZE};
use crate::limiter::{Cancelled, ConcurrencyLimiter};
use crate::media::{Item, MediaKind, VideoInfo};
use crate::merge::{log_report, reconcile_partition};
use crate::preprocess::preprocess_bounded;
use crate::prompts::{escape_xml_chars, excerpt};
use crate::types::{Assignment, Category, Cluster, ContentVariation, Description, Discovery, UNCATEGORIZED};

use super::output::{assemble, check_coverage, AssemblyInput, CategoryGroup, PipelineOutput};
use super::{Artifact, PassFailure, PassId, PassRecord, PassStatus, Pipeline, PipelineError, RunReport};

/// Final artifact written next to the checkpoints on every completed run.
const RESULTS_FILE: &str = "results.json";

pub(crate) struct Run {
    pub store: CheckpointStore,
    pub report: RunReport,
}

impl Run {
    pub fn record(&mut self, pass: PassId, status: PassStatus, started: Instant) {
        self.report.passes.push(PassRecord {
            pass,
            status,
            elapsed: started.elapsed(),
        });
    }
}

/// Fingerprint of an item set: identity, kind, size and modification time.
fn inventory_digest<'a>(items: impl IntoIterator<Item = &'a Item>) -> String {
    let fields: Vec<String> = items
        .into_iter()
        .map(|i| format!("{}:{:?}:{}:{}", i.id, i.kind, i.size_bytes, i.modified_ms))
        .collect();
    let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
    fingerprint(&refs)
}

/// Gather per-item results in submission order. Any failure fails the whole
/// pass once every sibling has finished.
fn collect<T, E>(pass: PassId, results: Vec<Result<Result<T, E>, Cancelled>>) -> Result<Vec<T>, PipelineError>
where
    E: Into<PassFailure>,
{
    let total = results.len();
    let mut out = Vec::with_capacity(total);
    let mut first: Option<PassFailure> = None;
    let mut failed = 0usize;
    let mut cancelled = false;
    for result in results {
        match result {
            Ok(Ok(value)) => out.push(value),
            Ok(Err(err)) => {
                failed += 1;
                if first.is_none() {
                    first = Some(err.into());
                }
            }
            Err(Cancelled) => cancelled = true,
        }
    }
    if let Some(first) = first {
        warn!(pass = %pass, failed, total, "items failed; aborting pass");
        let failure = if failed == 1 {
            first
        } else {
            PassFailure::Items {
                failed,
                total,
                first: Box::new(first),
            }
        };
        return Err(PipelineError::pass(pass, failure));
    }
    if cancelled {
        return Err(PipelineError::Cancelled { pass });
    }
    Ok(out)
}

fn assignment(pass: PassId, subject: &str, verdict: Verdict, discovery: &Discovery) -> Assignment {
    let flagged = !discovery.contains(&verdict.category);
    if flagged {
        warn!(
            pass = %pass,
            subject,
            category = %verdict.category,
            "answer outside the discovered categories; flagged"
        );
    }
    Assignment {
        subject: subject.to_string(),
        category: verdict.category,
        rationale: verdict.rationale,
        flagged,
    }
}

fn uncategorized(subject: &str, rationale: &str) -> Assignment {
    Assignment {
        subject: subject.to_string(),
        category: UNCATEGORIZED.to_string(),
        rationale: rationale.to_string(),
        flagged: true,
    }
}

fn corpus_entry(d: &Description, hook: Option<&str>) -> CorpusEntry {
    let mut text = format!(
        "Visual: {}\nTone: {}\nMessage: {}\nAwareness: {}",
        d.visual_elements, d.emotional_tone, d.implied_message, d.awareness_stage
    );
    if !d.transcript_summary.is_empty() {
        text.push_str(&format!("\nTranscript: {}", d.transcript_summary));
    }
    if let Some(hook) = hook.filter(|h| !h.is_empty()) {
        text.push_str(&format!("\nHook: {hook}"));
    }
    CorpusEntry {
        item_id: d.item_id.clone(),
        text: escape_xml_chars(&text),
    }
}

fn grouping_entry(item_id: &str, visual: PathBuf, description: Option<&Description>) -> GroupingEntry {
    GroupingEntry {
        item_id: item_id.to_string(),
        visual,
        summary: description
            .map(|d| format!("{} / {}", d.visual_elements, d.implied_message))
            .unwrap_or_default(),
    }
}

/// Up to `n` items taken round-robin across the group's clusters.
fn representatives(group: &CategoryGroup, n: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0;
    while out.len() < n {
        let mut any = false;
        for cluster in &group.clusters {
            if let Some(id) = cluster.items.get(depth) {
                any = true;
                if out.len() < n {
                    out.push(id.as_str());
                }
            }
        }
        if !any {
            break;
        }
        depth += 1;
    }
    out
}

impl Pipeline {
    fn limiter(&self) -> ConcurrencyLimiter {
        ConcurrencyLimiter::with_cancel(self.config.max_concurrent, self.cancel.clone())
    }

    /// Fingerprint for a pass that calls the analyst.
    fn remote_fingerprint(&self, pass: PassId, inputs: &[&str]) -> String {
        let mut fields = vec![pass.as_str(), self.config.model.as_str(), self.analyst_tag.as_str()];
        fields.extend_from_slice(inputs);
        fingerprint(&fields)
    }

    pub(super) async fn drive(&self, run: &mut Run, items: &[Item], stop: PassId) -> Result<(), PipelineError> {
        if stop == PassId::Scan {
            return Ok(());
        }
        let images: Vec<&Item> = items.iter().filter(|i| i.kind == MediaKind::Image).collect();
        let videos: Vec<&Item> = items.iter().filter(|i| i.kind == MediaKind::Video).collect();

        let preprocessed = self.preprocess_pass(run, &videos).await?;
        if stop <= PassId::Preprocess {
            return Ok(());
        }
        let descriptions = self.describe_pass(run, items, &preprocessed).await?;
        if stop <= PassId::Describe {
            return Ok(());
        }
        let clusters = self.cluster_pass(run, &images, &descriptions).await?;
        if stop <= PassId::Cluster {
            return Ok(());
        }

        let concept_corpus: Vec<CorpusEntry> = descriptions
            .value
            .iter()
            .filter(|d| d.kind == MediaKind::Image)
            .map(|d| corpus_entry(d, None))
            .collect();
        let categories = self
            .discover_pass(
                run,
                PassId::DiscoverCategories,
                DiscoveryDomain::CreativeConcepts,
                concept_corpus,
                &[&descriptions.digest],
            )
            .await?;
        if stop <= PassId::DiscoverCategories {
            return Ok(());
        }

        let transcripts: HashMap<&str, &str> = preprocessed
            .value
            .iter()
            .map(|v| (v.item_id.as_str(), v.transcript.as_str()))
            .collect();
        let hook_chars = self.config.hook_excerpt_chars;
        let hook_corpus: Vec<CorpusEntry> = descriptions
            .value
            .iter()
            .filter(|d| d.kind == MediaKind::Video)
            .map(|d| {
                let hook = transcripts
                    .get(d.item_id.as_str())
                    .map(|t| excerpt(t, hook_chars));
                corpus_entry(d, hook.as_deref())
            })
            .collect();
        let hook_chars = hook_chars.to_string();
        let hooks = self
            .discover_pass(
                run,
                PassId::DiscoverHooks,
                DiscoveryDomain::VideoHooks,
                hook_corpus,
                &[&descriptions.digest, &preprocessed.digest, &hook_chars],
            )
            .await?;
        if stop <= PassId::DiscoverHooks {
            return Ok(());
        }

        let labels = self.label_pass(run, &images, &clusters, &categories).await?;
        if stop <= PassId::LabelClusters {
            return Ok(());
        }
        let classes = self
            .classify_pass(run, &videos, &descriptions, &preprocessed, &hooks)
            .await?;
        if stop <= PassId::ClassifyVideos {
            return Ok(());
        }

        let upstream = Upstream {
            items,
            videos: &videos,
            preprocessed: &preprocessed,
            descriptions: &descriptions,
            clusters: &clusters,
            categories: &categories,
            hooks: &hooks,
            labels: &labels,
            classes: &classes,
        };
        let output = self.generate_pass(run, upstream).await?;
        self.write_results(&output.value).await?;
        run.report.output = Some(output.value);
        Ok(())
    }

    async fn preprocess_pass(
        &self,
        run: &mut Run,
        videos: &[&Item],
    ) -> Result<Artifact<Vec<VideoInfo>>, PipelineError> {
        let pass = PassId::Preprocess;
        let fp = fingerprint(&[pass.as_str(), &inventory_digest(videos.iter().copied())]);
        self.checkpointed(run, pass, fp, || async move {
            if videos.is_empty() {
                return Ok(Vec::new());
            }
            let preprocessor = self
                .preprocessor
                .as_deref()
                .ok_or(PipelineError::MissingPreprocessor {
                    videos: videos.len(),
                })?;
            let limiter = ConcurrencyLimiter::with_cancel(self.config.local_workers, self.cancel.clone());
            let timeout = self.config.preprocess_timeout();
            let poll = self.config.preprocess_poll_interval();
            let results = limiter
                .run_all(
                    videos
                        .iter()
                        .map(|v| preprocess_bounded(preprocessor, v, timeout, poll)),
                )
                .await;
            collect(pass, results)
        })
        .await
    }

    async fn describe_pass(
        &self,
        run: &mut Run,
        items: &[Item],
        preprocessed: &Artifact<Vec<VideoInfo>>,
    ) -> Result<Artifact<Vec<Description>>, PipelineError> {
        let pass = PassId::Describe;
        let transcript_chars = self.config.transcript_chars.to_string();
        let fp = self.remote_fingerprint(
            pass,
            &[&inventory_digest(items), &preprocessed.digest, &transcript_chars],
        );
        let infos = &preprocessed.value;
        self.checkpointed(run, pass, fp, || async move {
            let by_id: HashMap<&str, &VideoInfo> =
                infos.iter().map(|v| (v.item_id.as_str(), v)).collect();
            let analyst = self.analyst.as_ref();
            let limiter = self.limiter();
            let results = limiter
                .run_all(
                    items
                        .iter()
                        .map(|item| analyst.describe(item, by_id.get(item.id.as_str()).copied())),
                )
                .await;
            let descriptions = collect(pass, results)?;
            info!(items = descriptions.len(), peak = limiter.peak(), "described items");
            Ok(descriptions)
        })
        .await
    }

    async fn cluster_pass(
        &self,
        run: &mut Run,
        images: &[&Item],
        descriptions: &Artifact<Vec<Description>>,
    ) -> Result<Artifact<Vec<Cluster>>, PipelineError> {
        let pass = PassId::Cluster;
        let c = &self.config;
        let params = [
            self.distance_threshold().to_string(),
            c.max_cluster_size.to_string(),
            c.split_factor.to_string(),
            c.max_split_depth.to_string(),
        ];
        let inventory = inventory_digest(images.iter().copied());
        let mut fields: Vec<&str> = vec![pass.as_str(), inventory.as_str(), descriptions.digest.as_str()];
        fields.extend(params.iter().map(String::as_str));
        let batch_size = c.global_batch_size.to_string();
        match c.grouping {
            GroupingStrategy::Similarity => {
                fields.extend(["similarity", self.extractor.id()]);
            }
            GroupingStrategy::Remote => {
                fields.extend(["remote", c.model.as_str(), self.analyst_tag.as_str(), batch_size.as_str()]);
            }
        }
        let fp = fingerprint(&fields);

        let descriptions = &descriptions.value;
        self.checkpointed(run, pass, fp, || async move {
            let ids: Vec<String> = images.iter().map(|i| i.id.clone()).collect();
            let proposed = match self.config.grouping {
                GroupingStrategy::Similarity => {
                    self.similarity_clusters(images, &ids, descriptions).await?
                }
                GroupingStrategy::Remote => self.remote_clusters(images, descriptions).await?,
            };
            let (clusters, report) = reconcile_partition(&ids, proposed);
            log_report("global_clusters", &report);
            info!(
                images = ids.len(),
                clusters = clusters.len(),
                largest = clusters.iter().map(Cluster::len).max().unwrap_or(0),
                "clustered images"
            );
            Ok(clusters)
        })
        .await
    }

    /// Configured threshold, or the extractor's own.
    fn distance_threshold(&self) -> f32 {
        self.config
            .cluster_distance_threshold
            .unwrap_or_else(|| self.extractor.distance_threshold())
    }

    async fn similarity_clusters(
        &self,
        images: &[&Item],
        ids: &[String],
        descriptions: &[Description],
    ) -> Result<Vec<Cluster>, PipelineError> {
        let pass = PassId::Cluster;
        let cache: Arc<dyn FeatureCache> = match &self.feature_cache {
            Some(cache) => Arc::clone(cache),
            None => {
                let cache = SqliteFeatureCache::new(self.config.feature_cache_path())
                    .map_err(|e| PipelineError::pass(pass, FeatureError::from(e)))?;
                Arc::new(cache)
            }
        };
        let owned: Vec<Item> = images.iter().map(|i| (*i).clone()).collect();
        let vectors = compute_features(
            &owned,
            self.extractor.as_ref(),
            cache.as_ref(),
            self.config.local_workers,
        )
        .await
        .map_err(|e| PipelineError::pass(pass, e))?;

        let by_id: HashMap<String, Description> = descriptions
            .iter()
            .filter(|d| d.kind == MediaKind::Image)
            .map(|d| (d.item_id.clone(), d.clone()))
            .collect();
        SimilarityClusterer::new(ClusterParams::from_config(
            &self.config,
            self.extractor.distance_threshold(),
        ))
            .cluster(ids, &vectors, &by_id)
            .map_err(|e| PipelineError::pass(pass, e))
    }

    async fn remote_clusters(
        &self,
        images: &[&Item],
        descriptions: &[Description],
    ) -> Result<Vec<Cluster>, PipelineError> {
        let by_id: HashMap<&str, &Description> =
            descriptions.iter().map(|d| (d.item_id.as_str(), d)).collect();
        let entries: Vec<GroupingEntry> = images
            .iter()
            .map(|item| grouping_entry(&item.id, item.path.clone(), by_id.get(item.id.as_str()).copied()))
            .collect();
        let batch_size = NonZeroUsize::new(self.config.global_batch_size).unwrap_or(GLOBAL_BATCH_SIZE);
        RemoteGrouper::new(Arc::clone(&self.analyst), self.limiter())
            .with_batch_size(batch_size)
            .group(&format!("All {} images", entries.len()), &entries)
            .await
            .map_err(|e| PipelineError::grouping(PassId::Cluster, e))
    }

    /// Visual sub-groups inside one category of a finished run, grouped
    /// remotely at the per-category batch ceiling. Videos are left out.
    pub async fn subgroup_category(
        &self,
        output: &PipelineOutput,
        category: &str,
    ) -> Result<Vec<Cluster>, PipelineError> {
        let Some(group) = output.group(category) else {
            return Ok(Vec::new());
        };
        let entries: Vec<GroupingEntry> = group
            .item_ids()
            .filter_map(|id| output.description(id))
            .filter(|d| d.kind == MediaKind::Image)
            .map(|d| grouping_entry(&d.item_id, self.config.input_dir.join(&d.item_id), Some(d)))
            .collect();
        let batch_size = NonZeroUsize::new(self.config.category_batch_size).unwrap_or(CATEGORY_BATCH_SIZE);
        RemoteGrouper::new(Arc::clone(&self.analyst), self.limiter())
            .with_batch_size(batch_size)
            .group(&format!("category:{category}"), &entries)
            .await
            .map_err(|e| PipelineError::grouping(PassId::Cluster, e))
    }

    async fn discover_pass(
        &self,
        run: &mut Run,
        pass: PassId,
        domain: DiscoveryDomain,
        corpus: Vec<CorpusEntry>,
        inputs: &[&str],
    ) -> Result<Artifact<Discovery>, PipelineError> {
        let fp = self.remote_fingerprint(pass, inputs);
        self.checkpointed(run, pass, fp, || async move {
            if corpus.is_empty() {
                info!(pass = %pass, domain = domain.as_str(), "nothing to discover");
                return Ok(Discovery::default());
            }
            let discovery = self
                .analyst
                .discover_groups(domain, &corpus)
                .await
                .map_err(|e| PipelineError::pass(pass, e))?;
            info!(
                pass = %pass,
                domain = domain.as_str(),
                items = corpus.len(),
                categories = discovery.categories.len(),
                "discovered categories"
            );
            Ok(discovery)
        })
        .await
    }

    async fn label_pass(
        &self,
        run: &mut Run,
        images: &[&Item],
        clusters: &Artifact<Vec<Cluster>>,
        categories: &Artifact<Discovery>,
    ) -> Result<Artifact<Vec<Assignment>>, PipelineError> {
        let pass = PassId::LabelClusters;
        let reps = self.config.label_representatives;
        let reps_field = reps.to_string();
        let fp = self.remote_fingerprint(pass, &[&clusters.digest, &categories.digest, &reps_field]);
        let (clusters, discovery) = (&clusters.value, &categories.value);
        self.checkpointed(run, pass, fp, || async move {
            if discovery.categories.is_empty() {
                if !clusters.is_empty() {
                    warn!(clusters = clusters.len(), "no image categories discovered; clusters left uncategorized");
                }
                return Ok(clusters
                    .iter()
                    .map(|c| uncategorized(&c.name, "No image categories were discovered"))
                    .collect());
            }
            let paths: HashMap<&str, &Path> =
                images.iter().map(|i| (i.id.as_str(), i.path.as_path())).collect();
            let analyst = self.analyst.as_ref();
            let results = self
                .limiter()
                .run_all(clusters.iter().map(|cluster| {
                    let visuals: Vec<PathBuf> = cluster
                        .members
                        .iter()
                        .take(reps)
                        .filter_map(|m| paths.get(m.as_str()).map(|p| p.to_path_buf()))
                        .collect();
                    analyst.label_group(LabelRequest { cluster, visuals }, &discovery.categories)
                }))
                .await;
            let verdicts = collect(pass, results)?;
            Ok(clusters
                .iter()
                .zip(verdicts)
                .map(|(c, v)| assignment(pass, &c.name, v, discovery))
                .collect())
        })
        .await
    }

    async fn classify_pass(
        &self,
        run: &mut Run,
        videos: &[&Item],
        descriptions: &Artifact<Vec<Description>>,
        preprocessed: &Artifact<Vec<VideoInfo>>,
        hooks: &Artifact<Discovery>,
    ) -> Result<Artifact<Vec<Assignment>>, PipelineError> {
        let pass = PassId::ClassifyVideos;
        let hook_chars = self.config.hook_excerpt_chars;
        let hook_field = hook_chars.to_string();
        let fp = self.remote_fingerprint(
            pass,
            &[
                &inventory_digest(videos.iter().copied()),
                &hooks.digest,
                &descriptions.digest,
                &preprocessed.digest,
                &hook_field,
            ],
        );
        let (descriptions, infos, discovery) =
            (&descriptions.value, &preprocessed.value, &hooks.value);
        self.checkpointed(run, pass, fp, || async move {
            if videos.is_empty() {
                return Ok(Vec::new());
            }
            if discovery.categories.is_empty() {
                warn!(videos = videos.len(), "no hook categories discovered; videos left uncategorized");
                return Ok(videos
                    .iter()
                    .map(|v| uncategorized(&v.id, "No hook categories were discovered"))
                    .collect());
            }
            let descs: HashMap<&str, &Description> =
                descriptions.iter().map(|d| (d.item_id.as_str(), d)).collect();
            let infos: HashMap<&str, &VideoInfo> =
                infos.iter().map(|v| (v.item_id.as_str(), v)).collect();
            let analyst = self.analyst.as_ref();
            let results = self
                .limiter()
                .run_all(videos.iter().map(|video| {
                    let info = infos.get(video.id.as_str()).copied();
                    let req = ClassifyRequest {
                        item_id: &video.id,
                        visual: info.and_then(VideoInfo::thumbnail).map(Path::to_path_buf),
                        hook_excerpt: info
                            .map(|i| excerpt(&i.transcript, hook_chars))
                            .unwrap_or_default(),
                        description: descs.get(video.id.as_str()).copied(),
                    };
                    analyst.classify(req, &discovery.categories)
                }))
                .await;
            let verdicts = collect(pass, results)?;
            Ok(videos
                .iter()
                .zip(verdicts)
                .map(|(v, verdict)| assignment(pass, &v.id, verdict, discovery))
                .collect())
        })
        .await
    }

    async fn generate_pass(
        &self,
        run: &mut Run,
        up: Upstream<'_>,
    ) -> Result<Artifact<PipelineOutput>, PipelineError> {
        let pass = PassId::GenerateContent;
        let c = &self.config;
        let mode = match c.content_mode {
            ContentMode::PerCategory => "per_category",
            ContentMode::PerCluster => "per_cluster",
        };
        let (variations, reps) = (c.variations_per_group.to_string(), c.content_representatives.to_string());
        let fp = self.remote_fingerprint(
            pass,
            &[
                &inventory_digest(up.items),
                &up.preprocessed.digest,
                &up.descriptions.digest,
                &up.clusters.digest,
                &up.categories.digest,
                &up.hooks.digest,
                &up.labels.digest,
                &up.classes.digest,
                mode,
                &variations,
                &reps,
            ],
        );
        self.checkpointed(run, pass, fp, || async move {
            let videos: Vec<Item> = up.videos.iter().map(|v| (*v).clone()).collect();
            let mut output = assemble(AssemblyInput {
                categories: &up.categories.value,
                hooks: &up.hooks.value,
                clusters: &up.clusters.value,
                labels: &up.labels.value,
                videos: &videos,
                classifications: &up.classes.value,
                descriptions: &up.descriptions.value,
            });
            let gap = check_coverage(&output, up.items);
            if !gap.is_empty() {
                return Err(PipelineError::Coverage(gap));
            }
            self.fill_variations(&mut output, up.items, &up.preprocessed.value)
                .await?;
            Ok(output)
        })
        .await
    }

    /// One content call per category or per cluster, depending on the mode.
    async fn fill_variations(
        &self,
        output: &mut PipelineOutput,
        items: &[Item],
        infos: &[VideoInfo],
    ) -> Result<(), PipelineError> {
        let pass = PassId::GenerateContent;
        let visuals: HashMap<&str, PathBuf> = items
            .iter()
            .filter_map(|item| match item.kind {
                MediaKind::Image => Some((item.id.as_str(), item.path.clone())),
                MediaKind::Video => infos
                    .iter()
                    .find(|v| v.item_id == item.id)
                    .and_then(VideoInfo::thumbnail)
                    .map(|p| (item.id.as_str(), p.to_path_buf())),
            })
            .collect();
        let n = self.config.content_representatives;
        let per_cluster = self.config.content_mode == ContentMode::PerCluster;

        // (group index, cluster index when per cluster)
        let targets: Vec<(usize, Option<usize>)> = output
            .groups
            .iter()
            .enumerate()
            .flat_map(|(gi, g)| {
                if per_cluster {
                    (0..g.clusters.len()).map(|ci| (gi, Some(ci))).collect::<Vec<_>>()
                } else {
                    vec![(gi, None)]
                }
            })
            .collect();

        let results: Vec<Result<Result<Vec<ContentVariation>, _>, Cancelled>> = {
            let snapshot: &PipelineOutput = output;
            let analyst = self.analyst.as_ref();
            let requests: Vec<ContentRequest<'_>> = targets
                .iter()
                .map(|&(gi, ci)| {
                    let group = &snapshot.groups[gi];
                    let (name, rep_ids): (&str, Vec<&str>) = match ci {
                        Some(ci) => {
                            let cluster = &group.clusters[ci];
                            (
                                cluster.name.as_str(),
                                cluster.items.iter().take(n).map(String::as_str).collect(),
                            )
                        }
                        None => (group.category.as_str(), representatives(group, n)),
                    };
                    let category: Option<&Category> = snapshot.category(&group.category);
                    ContentRequest {
                        group: name,
                        category,
                        descriptions: rep_ids
                            .iter()
                            .filter_map(|id| snapshot.descriptions.get(*id))
                            .collect(),
                        visuals: rep_ids
                            .iter()
                            .filter_map(|id| visuals.get(*id).cloned())
                            .collect(),
                        variations: self.config.variations_per_group,
                    }
                })
                .collect();
            self.limiter()
                .run_all(requests.into_iter().map(|req| analyst.generate_content(req)))
                .await
        };
        let generated = collect(pass, results)?;

        for (&(gi, ci), variations) in targets.iter().zip(generated) {
            let group = &mut output.groups[gi];
            match ci {
                Some(ci) => group.clusters[ci].variations = variations,
                None => {
                    for cluster in &mut group.clusters {
                        cluster.variations = variations.clone();
                    }
                }
            }
        }
        info!(
            groups = output.groups.len(),
            calls = targets.len(),
            "generated content"
        );
        Ok(())
    }

    /// Plain copy of the final artifact at `<output_dir>/results.json`.
    async fn write_results(&self, output: &PipelineOutput) -> Result<(), PipelineError> {
        let path = self.config.output_dir.join(RESULTS_FILE);
        let bytes = serde_json::to_vec_pretty(output).map_err(|source| CheckpointError::Serialize {
            pass: PassId::GenerateContent.to_string(),
            source,
        })?;
        write_atomic(&path, &bytes).await?;
        info!(path = %path.display(), "wrote results");
        Ok(())
    }
}

/// Every artifact GenerateContent consumes.
#[derive(Clone, Copy)]
struct Upstream<'a> {
    items: &'a [Item],
    videos: &'a [&'a Item],
    preprocessed: &'a Artifact<Vec<VideoInfo>>,
    descriptions: &'a Artifact<Vec<Description>>,
    clusters: &'a Artifact<Vec<Cluster>>,
    categories: &'a Artifact<Discovery>,
    hooks: &'a Artifact<Discovery>,
    labels: &'a Artifact<Vec<Assignment>>,
    classes: &'a Artifact<Vec<Assignment>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::output::ClusterEntry;

    fn entry(name: &str, items: &[&str]) -> ClusterEntry {
        ClusterEntry {
            name: name.into(),
            rationale: String::new(),
            items: items.iter().map(|s| s.to_string()).collect(),
            flagged: false,
            variations: Vec::new(),
        }
    }

    #[test]
    fn representatives_round_robin_across_clusters() {
        let group = CategoryGroup {
            category: "c".into(),
            display_name: "C".into(),
            clusters: vec![entry("x", &["a", "b", "c"]), entry("y", &["d"]), entry("z", &["e", "f"])],
        };
        assert_eq!(representatives(&group, 4), vec!["a", "d", "e", "b"]);
        assert_eq!(representatives(&group, 10), vec!["a", "d", "e", "b", "f", "c"]);
    }

    #[test]
    fn collect_reports_first_failure_and_count() {
        let results: Vec<Result<Result<u32, crate::analyst::AnalystError>, Cancelled>> = vec![
            Ok(Ok(1)),
            Ok(Err(crate::analyst::AnalystError::Parse {
                caller: "t",
                message: "bad".into(),
            })),
            Ok(Err(crate::analyst::AnalystError::Parse {
                caller: "t",
                message: "worse".into(),
            })),
        ];
        let err = collect(PassId::Describe, results).unwrap_err();
        match err {
            PipelineError::Pass {
                pass,
                source: PassFailure::Items { failed, total, .. },
            } => {
                assert_eq!(pass, PassId::Describe);
                assert_eq!((failed, total), (2, 3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn inventory_digest_tracks_mtime() {
        let mut item = Item {
            id: "a.jpg".into(),
            path: PathBuf::from("a.jpg"),
            kind: MediaKind::Image,
            size_bytes: 3,
            modified_ms: 1,
        };
        let before = inventory_digest([&item]);
        item.modified_ms = 2;
        assert_ne!(before, inventory_digest([&item]));
    }
}
