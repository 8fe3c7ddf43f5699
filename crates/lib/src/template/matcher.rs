//! Scores how well an incoming document matches a stored template.
//!
//! The score is a weighted blend of three signals:
//! structural signature overlap (0.7), token-frequency overlap (0.2) and
//! a character-level longest-common-subsequence ratio (0.1). A template
//! is applicable only when the blended score reaches the similarity
//! threshold and the template has enough learning samples behind it.

use crate::template::{StructuralSignature, Template};
use crate::types::ParsedDocument;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Portuguese stopwords excluded from signatures and token overlap.
pub(crate) const STOPWORDS_PT: &[&str] = &[
    "a", "à", "ao", "aos", "as", "com", "como", "da", "das", "de", "do", "dos", "e", "em", "entre",
    "era", "essa", "esse", "esta", "este", "eu", "foi", "há", "isso", "já", "mais", "mas", "me",
    "mesmo", "na", "nas", "não", "no", "nos", "nº", "o", "os", "ou", "para", "pela", "pelo", "por",
    "qual", "quando", "que", "se", "sem", "ser", "seu", "sua", "são", "também", "tem", "um", "uma",
    "você",
];

const MAX_FREQUENT_TOKENS: usize = 200;
const CHAR_SAMPLE_BYTES: usize = 2048;

const WEIGHT_STRUCTURAL: f64 = 0.7;
const WEIGHT_TOKENS: f64 = 0.2;
const WEIGHT_CHARACTERS: f64 = 0.1;

fn is_stopword(token: &str) -> bool {
    STOPWORDS_PT.contains(&token)
}

/// Case-folded, accent-preserving word tokens with stopwords removed.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .filter(|t| !is_stopword(t))
        .collect()
}

/// Tokens that look like printed field labels: the words of short
/// elements, which in forms are headings and `Nome:`-style anchors.
pub(crate) fn anchor_tokens(doc: &ParsedDocument) -> BTreeSet<String> {
    let mut anchors = BTreeSet::new();
    for element in &doc.elements {
        if element.text.split_whitespace().count() > 6 {
            continue;
        }
        for token in tokenize(&element.text) {
            if token.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            anchors.insert(token);
        }
    }
    anchors
}

pub struct TemplateMatcher {
    similarity_threshold: f64,
    min_samples: u32,
}

impl TemplateMatcher {
    pub fn new(similarity_threshold: f64, min_samples: u32) -> Self {
        Self {
            similarity_threshold,
            min_samples,
        }
    }

    /// Returns the index of the best applicable template and its score,
    /// or `None` when no candidate passes the application gate.
    pub fn best_match(
        &self,
        doc: &ParsedDocument,
        candidates: &[Template],
    ) -> Option<(usize, f64)> {
        let doc_anchors = anchor_tokens(doc);
        let doc_text = doc.full_text();
        let mut best: Option<(usize, f64)> = None;

        for (index, template) in candidates.iter().enumerate() {
            if template.sample_count < self.min_samples {
                continue;
            }
            let score = self.similarity(&doc_text, &doc_anchors, template);
            debug!(
                label = %template.label,
                template_id = %template.id,
                score,
                "Scored template candidate"
            );
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((index, score));
            }
        }

        best.filter(|&(_, score)| self.passes_gate(score))
    }

    /// The application gate. Exactly-at-threshold scores are accepted.
    pub fn passes_gate(&self, similarity: f64) -> bool {
        similarity >= self.similarity_threshold
    }

    pub fn similarity(
        &self,
        doc_text: &str,
        doc_anchors: &BTreeSet<String>,
        template: &Template,
    ) -> f64 {
        let s_structural = structural_similarity(&template.signature, doc_anchors);
        let s_tokens = token_similarity(&template.reference_text, doc_text);
        let s_characters = character_similarity(&template.reference_text, doc_text);
        WEIGHT_STRUCTURAL * s_structural
            + WEIGHT_TOKENS * s_tokens
            + WEIGHT_CHARACTERS * s_characters
    }
}

/// Jaccard of the template signature against the anchors detected in the
/// document.
fn structural_similarity(signature: &StructuralSignature, doc_anchors: &BTreeSet<String>) -> f64 {
    let template_side: BTreeSet<&str> = signature
        .schema_keys
        .iter()
        .map(String::as_str)
        .chain(signature.anchor_tokens.iter().map(String::as_str))
        .collect();
    let doc_side: BTreeSet<&str> = doc_anchors.iter().map(String::as_str).collect();
    if template_side.is_empty() && doc_side.is_empty() {
        return 0.0;
    }
    let intersection = template_side.intersection(&doc_side).count() as f64;
    let union = template_side.union(&doc_side).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Multiset Jaccard over the top-200 most frequent tokens of each side.
fn token_similarity(reference: &str, document: &str) -> f64 {
    let a = top_token_counts(reference);
    let b = top_token_counts(document);
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let mut min_sum = 0usize;
    let mut max_sum = 0usize;
    for key in keys {
        let ca = a.get(key).copied().unwrap_or(0);
        let cb = b.get(key).copied().unwrap_or(0);
        min_sum += ca.min(cb);
        max_sum += ca.max(cb);
    }
    if max_sum == 0 {
        0.0
    } else {
        min_sum as f64 / max_sum as f64
    }
}

fn top_token_counts(text: &str) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_insert(0) += 1;
    }
    if counts.len() <= MAX_FREQUENT_TOKENS {
        return counts;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(MAX_FREQUENT_TOKENS);
    ranked.into_iter().collect()
}

/// LCS ratio between the truncated, normalised texts.
fn character_similarity(reference: &str, document: &str) -> f64 {
    let a: Vec<char> = normalise_for_chars(reference).chars().collect();
    let b: Vec<char> = normalise_for_chars(document).chars().collect();
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let lcs = lcs_length(&a, &b) as f64;
    2.0 * lcs / (a.len() + b.len()) as f64
}

/// Lowercases, drops digits (values vary between documents of the same
/// class), collapses whitespace and truncates to the first 2 KiB.
fn normalise_for_chars(text: &str) -> String {
    let lowered = text.to_lowercase();
    let collapsed = lowered
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>();
    let mut end = collapsed.len().min(CHAR_SAMPLE_BYTES);
    while !collapsed.is_char_boundary(end) {
        end -= 1;
    }
    collapsed[..end].to_string()
}

fn lcs_length(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
