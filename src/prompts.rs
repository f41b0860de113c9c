//! Prompt templates for the analysis calls.
//!
//! Domain logic for rendering prompts. Provider-agnostic: images travel
//! separately on the user message, prompts only carry text.

use crate::gateway::{ImageData, Message};

// =============================================================================
// Prompt instance
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }

    pub fn to_messages_with_images(&self, images: Vec<ImageData>) -> Vec<Message> {
        vec![
            Message::system(&self.system),
            Message::user_with_images(&self.user, images),
        ]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Truncate to `max` characters, appending `...` when anything was cut.
pub fn excerpt(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}

/// A prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitute `vars` into both halves. Values are inserted verbatim; callers
    /// escape user-provided text before building them.
    pub fn render(&self, brand_context: Option<&str>, vars: &[(&str, &str)]) -> PromptInstance {
        let fill = |template: &str| {
            vars.iter().fold(template.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        };
        let mut system = fill(self.system).trim().to_string();
        if let Some(ctx) = brand_context.map(str::trim).filter(|c| !c.is_empty()) {
            system = format!(
                "{system}\n\n<brand_context>\n{}\n</brand_context>",
                escape_xml_chars(ctx)
            );
        }
        PromptInstance {
            template_slug: self.slug,
            system,
            user: fill(self.user).trim().to_string(),
        }
    }
}

// =============================================================================
// Templates
// =============================================================================

const ANALYST_SYSTEM: &str = r#"You are a senior direct-response creative strategist. You analyze ad creatives (static images and short videos) for a single brand and reason about the strategic angle each one takes. Output only valid JSON matching the schema given in the request."#;

pub const DESCRIBE: PromptTemplate = PromptTemplate {
    slug: "describe_v1",
    system: ANALYST_SYSTEM,
    user: r#"Describe this ad creative ({item}, {kind}).
{video_context}
Return JSON:
{"visual_elements": "what is literally shown: people, product, text overlays, colours",
 "emotional_tone": "the feeling the creative evokes",
 "implied_message": "what it is trying to make the viewer believe",
 "awareness_stage": "unaware | problem-aware | solution-aware | product-aware | most-aware",
 "transcript_summary": "summary of the spoken audio, empty string for images"}"#,
};

pub const DISCOVER: PromptTemplate = PromptTemplate {
    slug: "discover_v1",
    system: ANALYST_SYSTEM,
    user: r#"Below are descriptions of {count} creatives.

<corpus>
{corpus}
</corpus>

{instructions}

Rules:
- Categories must be mutually exclusive and collectively exhaustive for THIS set.
- Aim for {min}-{max} categories.
- Every category name is a unique snake_case slug.
- List each creative's filename under exactly one category's example_items.

Return JSON:
{"rationale": "how you arrived at these categories",
 "categories": [{"name": "snake_case_slug", "display_name": "Human Name", "description": "what unites it",
   "sophistication_stage": "1-5", "belief_mapping": "which belief it builds", "example_items": ["file.jpg"]}]}"#,
};

pub const CLASSIFY: PromptTemplate = PromptTemplate {
    slug: "classify_v1",
    system: ANALYST_SYSTEM,
    user: r#"Classify the creative {item} into exactly one of these categories.

<categories>
{categories}
</categories>

<creative>
{details}
</creative>

Return JSON: {"category": "one of the category names above", "rationale": "why"}"#,
};

pub const LABEL: PromptTemplate = PromptTemplate {
    slug: "label_v1",
    system: ANALYST_SYSTEM,
    user: r#"The attached images are representatives of a visual group named {group} ({size} creatives: {members}).
Group rationale: {rationale}

<categories>
{categories}
</categories>

Pick the single category that best fits the whole group.
Return JSON: {"category": "one of the category names above", "rationale": "why"}"#,
};

pub const GENERATE: PromptTemplate = PromptTemplate {
    slug: "generate_v1",
    system: ANALYST_SYSTEM,
    user: r#"Write {variations} ad copy variations for the creative group {group}.

<group>
{details}
</group>

The attached images are representative creatives from this group. Each variation needs:
- primary_text: 2-4 sentences, direct-response style
- headline: under 40 characters, benefit-focused
- description: 40-80 characters, social proof, offer or guarantee

Return JSON: {"variations": [{"primary_text": "...", "headline": "...", "description": "..."}]}"#,
};

pub const GROUP_BATCH: PromptTemplate = PromptTemplate {
    slug: "group_batch_v1",
    system: ANALYST_SYSTEM,
    user: r#"The attached images are {count} creatives, in this order: {members}.

<descriptions>
{details}
</descriptions>

Group them into visual sub-groups of creatives that share a format, layout or visual treatment. A group of one is fine for an outlier.
Every filename must appear in exactly one group.

Return JSON: {"groups": [{"name": "snake_case_slug", "rationale": "shared visual pattern", "members": ["file.jpg"]}]}"#,
};

pub const MERGE: PromptTemplate = PromptTemplate {
    slug: "merge_v1",
    system: ANALYST_SYSTEM,
    user: r#"{scope} creatives were grouped in {batches} independent batches. Groups in different batches may describe the same visual pattern.

{brief}

Merge groups that describe the same pattern across batches and keep genuinely distinct groups separate. Use unique snake_case names.
The result must be a complete partition: all {total} filenames, each in exactly one group.

Return JSON: {"groups": [{"name": "snake_case_slug", "rationale": "shared visual pattern", "members": ["file.jpg"]}]}"#,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_placeholders_and_appends_brand_context() {
        let p = CLASSIFY.render(
            Some("Brand <X>"),
            &[("item", "a.jpg"), ("categories", "- hooks"), ("details", "d")],
        );
        assert!(p.user.contains("Classify the creative a.jpg"));
        assert!(p.user.contains("- hooks"));
        assert!(p.system.contains("<brand_context>\nBrand &lt;X&gt;\n</brand_context>"));
        assert_eq!(p.template_slug, "classify_v1");
    }

    #[test]
    fn excerpt_marks_truncation() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdefghij", 4), "abcd...");
    }
}
