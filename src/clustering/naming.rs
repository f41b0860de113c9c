//! Deterministic, unique cluster names from description keywords.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::Description;

/// Keywords joined into a cluster name.
pub const NAME_KEYWORDS: usize = 4;

/// Description snippets quoted in a cluster rationale.
const RATIONALE_SAMPLES: usize = 3;

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]+").expect("Invalid word regex"));

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "from", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
        "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can",
        "this", "that", "these", "those", "it", "its", "they", "them", "their", "we", "our",
        "you", "your", "he", "she", "his", "her", "image", "images", "ad", "creative",
        "creatives", "shows", "showing", "featuring", "features", "appears", "visible",
        "displayed", "background", "foreground", "text", "overlay", "overlays", "style",
        "various", "multiple", "single", "also", "very", "more", "most", "some", "all", "each",
        "every", "other", "such", "into", "over", "about", "up", "out", "off", "like", "just",
        "than", "then", "so", "no", "not", "only", "same",
    ]
    .into_iter()
    .collect()
});

/// Most frequent meaningful words across `texts`, ties broken by first
/// occurrence.
pub fn top_keywords<'a>(texts: impl IntoIterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for text in texts {
        let lowered = text.to_lowercase();
        for m in WORD.find_iter(&lowered) {
            let word = m.as_str();
            if word.len() <= 2 || STOPWORDS.contains(word) {
                continue;
            }
            let entry = counts.entry(word.to_string()).or_insert((0, order));
            entry.0 += 1;
            order += 1;
        }
    }
    let mut ranked: Vec<(String, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked.into_iter().take(limit).map(|(w, _, _)| w).collect()
}

/// `base` if unused, else `base_2`, `base_3`, ... Records the result in `used`.
pub fn unique_name(base: &str, used: &mut HashSet<String>) -> String {
    let mut name = base.to_string();
    let mut counter = 2;
    while used.contains(&name) {
        name = format!("{base}_{counter}");
        counter += 1;
    }
    used.insert(name.clone());
    name
}

/// Name and rationale for one cluster.
///
/// `position` is the cluster's zero-based index, used for the fallback name
/// when no description yields a keyword.
pub fn describe_cluster(
    position: usize,
    members: &[String],
    descriptions: &HashMap<String, Description>,
) -> (String, String) {
    let found: Vec<&Description> = members
        .iter()
        .filter_map(|m| descriptions.get(m))
        .collect();
    let keywords = top_keywords(
        found.iter().map(|d| d.visual_elements.as_str()),
        NAME_KEYWORDS,
    );
    let name = if keywords.is_empty() {
        format!("group_{}", position + 1)
    } else {
        keywords.join("_")
    };

    let rationale = if found.is_empty() {
        format!("Cluster of {} visually similar images", members.len())
    } else {
        let samples: Vec<String> = found
            .iter()
            .take(RATIONALE_SAMPLES)
            .map(|d| format!("{} ({})", d.visual_elements, d.emotional_tone))
            .collect();
        format!(
            "Cluster of {} visually similar images. Keywords: {}. Sample descriptions: {}",
            members.len(),
            keywords.join(", "),
            samples.join("; ")
        )
    };
    (name, rationale)
}
