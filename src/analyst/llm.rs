use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ImageData};
use crate::media::{load_image, Item, MediaKind, VideoInfo};
use crate::prompts::{self, escape_xml_chars, excerpt, PromptInstance};
use crate::types::{Category, Cluster, ContentVariation, Description, Discovery};

use super::structured::call_structured;
use super::{
    AnalystError, ClassifyRequest, ContentRequest, CorpusEntry, CreativeAnalyst,
    DiscoveryDomain, GroupingEntry, LabelRequest, MergeBrief, Verdict,
};

const DESCRIBE_MAX_TOKENS: u32 = 1_024;
const VERDICT_MAX_TOKENS: u32 = 1_024;
const GENERATE_MAX_TOKENS: u32 = 4_096;
const GROUP_BATCH_MAX_TOKENS: u32 = 4_096;

// =============================================================================
// Response shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct DescriptionJson {
    visual_elements: String,
    emotional_tone: String,
    implied_message: String,
    #[serde(alias = "target_awareness_level")]
    awareness_stage: String,
    #[serde(default)]
    transcript_summary: String,
}

#[derive(Debug, Deserialize)]
struct DiscoveryJson {
    #[serde(default, alias = "reasoning")]
    rationale: String,
    categories: Vec<Category>,
}

#[derive(Debug, Deserialize)]
struct GroupJson {
    name: String,
    #[serde(default, alias = "reasoning")]
    rationale: String,
    #[serde(alias = "items", alias = "image_filenames")]
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GroupsJson {
    groups: Vec<GroupJson>,
}

impl From<GroupsJson> for Vec<Cluster> {
    fn from(parsed: GroupsJson) -> Self {
        parsed
            .groups
            .into_iter()
            .map(|g| Cluster::new(g.name, g.rationale, g.members))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct VariationsJson {
    variations: Vec<ContentVariation>,
}

// =============================================================================
// Analyst
// =============================================================================

/// [`CreativeAnalyst`] backed by a chat-completions gateway.
pub struct LlmAnalyst {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    brand_context: Option<String>,
    run_id: Option<Uuid>,
    transcript_chars: usize,
}

impl LlmAnalyst {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            brand_context: None,
            run_id: None,
            transcript_chars: 3_000,
        }
    }

    /// Brand background appended to every system prompt.
    pub fn with_brand_context(mut self, context: impl Into<String>) -> Self {
        self.brand_context = Some(context.into());
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_transcript_chars(mut self, chars: usize) -> Self {
        self.transcript_chars = chars;
        self
    }

    fn render(&self, template: &prompts::PromptTemplate, vars: &[(&str, &str)]) -> PromptInstance {
        template.render(self.brand_context.as_deref(), vars)
    }

    fn request(
        &self,
        caller: &'static str,
        subject: &str,
        messages: Vec<crate::gateway::Message>,
        max_tokens: u32,
    ) -> ChatRequest {
        let mut attribution = Attribution::new(caller).with_subject(subject);
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        ChatRequest::new(ChatModel::openrouter(&self.model), messages, attribution)
            .max_tokens(max_tokens)
    }
}

async fn load_visuals(paths: &[PathBuf]) -> Result<Vec<ImageData>, AnalystError> {
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        let image = load_image(path).await.map_err(|source| AnalystError::Media {
            path: path.clone(),
            source,
        })?;
        images.push(image);
    }
    Ok(images)
}

fn render_categories(categories: &[Category]) -> String {
    categories
        .iter()
        .map(|c| {
            format!(
                "- {}: {} ({})",
                escape_xml_chars(&c.name),
                escape_xml_chars(&c.display_name),
                escape_xml_chars(&c.description)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_description(d: &Description) -> String {
    let mut out = format!(
        "Visual: {}\nTone: {}\nMessage: {}\nAwareness: {}",
        d.visual_elements, d.emotional_tone, d.implied_message, d.awareness_stage
    );
    if !d.transcript_summary.is_empty() {
        out.push_str(&format!("\nTranscript: {}", d.transcript_summary));
    }
    escape_xml_chars(&out)
}

/// Keep the first category of each name.
fn dedupe_categories(domain: DiscoveryDomain, categories: Vec<Category>) -> Vec<Category> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(categories.len());
    for category in categories {
        if seen.insert(category.name.clone()) {
            out.push(category);
        } else {
            warn!(
                domain = domain.as_str(),
                category = %category.name,
                "duplicate category name in discovery; keeping first"
            );
        }
    }
    out
}

#[async_trait]
impl CreativeAnalyst for LlmAnalyst {
    async fn describe(
        &self,
        item: &Item,
        video: Option<&VideoInfo>,
    ) -> Result<Description, AnalystError> {
        let (visuals, video_context) = match (item.kind, video) {
            (MediaKind::Video, Some(info)) => {
                let context = format!(
                    "The attached images are keyframes. Duration: {:.1}s.\n<transcript>\n{}\n</transcript>\n",
                    info.duration_secs,
                    escape_xml_chars(&excerpt(&info.transcript, self.transcript_chars))
                );
                (info.frames.clone(), context)
            }
            _ => (vec![item.path.clone()], String::new()),
        };
        let kind = match item.kind {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        };
        let prompt = self.render(
            &prompts::DESCRIBE,
            &[
                ("item", &escape_xml_chars(&item.id)),
                ("kind", kind),
                ("video_context", &video_context),
            ],
        );
        let images = load_visuals(&visuals).await?;
        let req = self.request(
            "analyst::describe",
            &item.id,
            prompt.to_messages_with_images(images),
            DESCRIBE_MAX_TOKENS,
        );
        let parsed: DescriptionJson = call_structured(self.gateway.as_ref(), req).await?;
        Ok(Description {
            item_id: item.id.clone(),
            kind: item.kind,
            visual_elements: parsed.visual_elements,
            emotional_tone: parsed.emotional_tone,
            implied_message: parsed.implied_message,
            awareness_stage: parsed.awareness_stage,
            transcript_summary: parsed.transcript_summary,
        })
    }

    async fn discover_groups(
        &self,
        domain: DiscoveryDomain,
        corpus: &[CorpusEntry],
    ) -> Result<Discovery, AnalystError> {
        let rendered = corpus
            .iter()
            .map(|e| format!("### {}\n{}", escape_xml_chars(&e.item_id), e.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let (min, max) = domain.target_range();
        let count = corpus.len().to_string();
        let (min, max) = (min.to_string(), max.to_string());
        let prompt = self.render(
            &prompts::DISCOVER,
            &[
                ("count", &count),
                ("corpus", &rendered),
                ("instructions", domain.instructions()),
                ("min", &min),
                ("max", &max),
            ],
        );
        let req = self.request(
            "analyst::discover",
            domain.as_str(),
            prompt.to_messages(),
            domain.max_output_tokens(),
        )
        .streaming();
        let parsed: DiscoveryJson = call_structured(self.gateway.as_ref(), req).await?;
        Ok(Discovery {
            rationale: parsed.rationale,
            categories: dedupe_categories(domain, parsed.categories),
        })
    }

    async fn classify(
        &self,
        req: ClassifyRequest<'_>,
        categories: &[Category],
    ) -> Result<Verdict, AnalystError> {
        let mut details = String::new();
        if let Some(d) = req.description {
            details.push_str(&render_description(d));
        }
        if !req.hook_excerpt.is_empty() {
            details.push_str(&format!(
                "\nHook excerpt: {}",
                escape_xml_chars(&req.hook_excerpt)
            ));
        }
        let prompt = self.render(
            &prompts::CLASSIFY,
            &[
                ("item", &escape_xml_chars(req.item_id)),
                ("categories", &render_categories(categories)),
                ("details", details.trim()),
            ],
        );
        let visuals: Vec<PathBuf> = req.visual.into_iter().collect();
        let images = load_visuals(&visuals).await?;
        let chat = self.request(
            "analyst::classify",
            req.item_id,
            prompt.to_messages_with_images(images),
            VERDICT_MAX_TOKENS,
        );
        call_structured(self.gateway.as_ref(), chat).await
    }

    async fn label_group(
        &self,
        req: LabelRequest<'_>,
        categories: &[Category],
    ) -> Result<Verdict, AnalystError> {
        let size = req.cluster.len().to_string();
        let members = escape_xml_chars(&req.cluster.members.join(", "));
        let prompt = self.render(
            &prompts::LABEL,
            &[
                ("group", &escape_xml_chars(&req.cluster.name)),
                ("size", &size),
                ("members", &members),
                ("rationale", &escape_xml_chars(&req.cluster.rationale)),
                ("categories", &render_categories(categories)),
            ],
        );
        let images = load_visuals(&req.visuals).await?;
        let chat = self.request(
            "analyst::label",
            &req.cluster.name,
            prompt.to_messages_with_images(images),
            VERDICT_MAX_TOKENS,
        );
        call_structured(self.gateway.as_ref(), chat).await
    }

    async fn generate_content(
        &self,
        req: ContentRequest<'_>,
    ) -> Result<Vec<ContentVariation>, AnalystError> {
        let mut details = Vec::new();
        if let Some(c) = req.category {
            details.push(format!(
                "Category: {} ({})\nBelief: {}",
                escape_xml_chars(&c.display_name),
                escape_xml_chars(&c.description),
                escape_xml_chars(&c.belief_mapping)
            ));
        }
        for d in &req.descriptions {
            details.push(format!("### {}\n{}", escape_xml_chars(&d.item_id), render_description(d)));
        }
        let variations = req.variations.to_string();
        let prompt = self.render(
            &prompts::GENERATE,
            &[
                ("variations", &variations),
                ("group", &escape_xml_chars(req.group)),
                ("details", &details.join("\n\n")),
            ],
        );
        let images = load_visuals(&req.visuals).await?;
        let chat = self.request(
            "analyst::generate",
            req.group,
            prompt.to_messages_with_images(images),
            GENERATE_MAX_TOKENS,
        );
        let parsed: VariationsJson = call_structured(self.gateway.as_ref(), chat).await?;
        let mut out = parsed.variations;
        if out.len() < req.variations {
            warn!(
                group = req.group,
                requested = req.variations,
                returned = out.len(),
                "fewer content variations than requested"
            );
        }
        out.truncate(req.variations);
        Ok(out)
    }

    async fn group_batch(&self, batch: &[GroupingEntry]) -> Result<Vec<Cluster>, AnalystError> {
        let members = batch
            .iter()
            .map(|e| escape_xml_chars(&e.item_id))
            .collect::<Vec<_>>()
            .join(", ");
        let details = batch
            .iter()
            .map(|e| format!("- {}: {}", escape_xml_chars(&e.item_id), escape_xml_chars(&e.summary)))
            .collect::<Vec<_>>()
            .join("\n");
        let count = batch.len().to_string();
        let prompt = self.render(
            &prompts::GROUP_BATCH,
            &[("count", &count), ("members", &members), ("details", &details)],
        );
        let visuals: Vec<PathBuf> = batch.iter().map(|e| e.visual.clone()).collect();
        let images = load_visuals(&visuals).await?;
        let subject = batch.first().map(|e| e.item_id.as_str()).unwrap_or("");
        let chat = self.request(
            "analyst::group_batch",
            subject,
            prompt.to_messages_with_images(images),
            GROUP_BATCH_MAX_TOKENS,
        );
        let parsed: GroupsJson = call_structured(self.gateway.as_ref(), chat).await?;
        Ok(parsed.into())
    }

    async fn merge_groups(&self, brief: &MergeBrief) -> Result<Vec<Cluster>, AnalystError> {
        let batches = brief.batches.to_string();
        let total = brief.total_items.to_string();
        let prompt = self.render(
            &prompts::MERGE,
            &[
                ("scope", &escape_xml_chars(&brief.scope)),
                ("batches", &batches),
                ("brief", &brief.text),
                ("total", &total),
            ],
        );
        let chat = self.request(
            "analyst::merge",
            &brief.scope,
            prompt.to_messages(),
            brief.max_output_tokens,
        )
        .streaming();
        let parsed: GroupsJson = call_structured(self.gateway.as_ref(), chat).await?;
        Ok(parsed.into())
    }
}
