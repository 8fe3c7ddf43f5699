//! Learns field extraction patterns from successful LLM extractions.
//!
//! Each learning event replays the template's existing patterns against
//! the new document to grade them (an exponential moving average of
//! hit/miss outcomes), then induces fresh positional, contextual and
//! shape-regex patterns from where the LLM's values actually sit in the
//! document.

use crate::template::matcher::anchor_tokens;
use crate::template::{
    Direction, FieldExtractor, FieldPattern, PatternKind, StructuralSignature, Template,
};
use crate::types::{Element, ParsedDocument, Schema};
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// EMA smoothing for per-field confidence; seeded at 1.0 on creation.
const CONFIDENCE_ALPHA: f64 = 0.3;
/// A structural signature diverging more than this from every stored
/// template starts a sibling template instead of updating one.
const SIBLING_DELTA: f64 = 0.30;
/// A shape regex is only kept when it matches at most this many
/// substrings of the whole document.
const MAX_REGEX_MATCHES: usize = 3;
/// Anchors longer than this are prose, not labels.
const MAX_ANCHOR_TOKENS: usize = 6;

pub struct PatternLearner {
    extractor: FieldExtractor,
}

impl Default for PatternLearner {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternLearner {
    pub fn new() -> Self {
        Self {
            extractor: FieldExtractor::new(),
        }
    }

    /// Folds one LLM extraction into the label's template set and returns
    /// the template to persist. The nearest-signature template is updated
    /// in place; a document whose signature diverges more than 30% from
    /// every candidate starts a sibling.
    pub fn learn(
        &self,
        candidates: &[Template],
        label: &str,
        doc: &ParsedDocument,
        schema: &Schema,
        data: &BTreeMap<String, Option<String>>,
    ) -> Template {
        let doc_signature = StructuralSignature {
            schema_keys: schema.field_names().iter().map(|s| s.to_string()).collect(),
            anchor_tokens: anchor_tokens(doc),
        };

        let nearest = candidates
            .iter()
            .map(|t| (t, t.signature.delta(&doc_signature)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut template = match nearest {
            Some((existing, delta)) if delta <= SIBLING_DELTA => {
                debug!(
                    label,
                    template_id = %existing.id,
                    delta,
                    "Updating existing template"
                );
                existing.clone()
            }
            Some((_, delta)) => {
                info!(label, delta, "Signature diverged; starting sibling template");
                self.fresh_template(label, doc, &doc_signature)
            }
            None => {
                info!(label, "First sample; creating template");
                self.fresh_template(label, doc, &doc_signature)
            }
        };

        let updating = template.sample_count > 0;
        for field in schema.iter() {
            let Some(Some(value)) = data.get(&field.name) else {
                continue;
            };
            if updating {
                self.grade_field(&mut template, &field.name, value, doc);
            } else {
                template.field_confidence.insert(field.name.clone(), 1.0);
            }
            let induced = self.induce(doc, value);
            if !induced.extractors.is_empty() {
                template.field_patterns.insert(field.name.clone(), induced);
            }
            template
                .field_confidence
                .entry(field.name.clone())
                .or_insert(1.0);
        }

        if updating {
            template.signature = merge_signatures(&template.signature, &doc_signature);
        }
        template.sample_count += 1;
        template.updated_at = Utc::now();
        template
    }

    fn fresh_template(
        &self,
        label: &str,
        doc: &ParsedDocument,
        signature: &StructuralSignature,
    ) -> Template {
        let now = Utc::now();
        Template {
            id: Uuid::new_v4(),
            label: label.to_string(),
            sample_count: 0,
            signature: signature.clone(),
            field_patterns: BTreeMap::new(),
            field_confidence: BTreeMap::new(),
            reference_text: doc.full_text(),
            coord_space: doc.coord_space.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// One Bernoulli trial: does the stored pattern, replayed against the
    /// new document, reproduce the value the LLM just extracted?
    fn grade_field(&self, template: &mut Template, field: &str, value: &str, doc: &ParsedDocument) {
        let Some(pattern) = template.field_patterns.get(field) else {
            return;
        };
        let applied = self.extractor.apply(pattern, doc, &template.coord_space);
        let outcome = applied
            .map(|got| normalise(&got) == normalise(value))
            .unwrap_or(false);
        let observed = if outcome { 1.0 } else { 0.0 };
        let confidence = template.field_confidence.entry(field.to_string()).or_insert(1.0);
        *confidence = CONFIDENCE_ALPHA * observed + (1.0 - CONFIDENCE_ALPHA) * *confidence;
    }

    /// Induces the pattern disjunction for one observed value.
    pub(crate) fn induce(&self, doc: &ParsedDocument, value: &str) -> FieldPattern {
        let mut extractors = Vec::new();

        if let Some(element) = exact_element(doc, value) {
            extractors.push(PatternKind::Positional {
                page: element.page,
                x: element.bbox.x0,
                y: element.bbox.y0,
                w: element.bbox.width(),
                h: element.bbox.height(),
            });
            if let Some((anchor, direction)) = neighbouring_anchor(doc, element) {
                extractors.push(PatternKind::Contextual { anchor, direction });
            }
        } else if let Some((_, anchor)) = embedded_value(doc, value) {
            // Value shares its element with the printed label, e.g. the
            // single fragment "Nome: João Silva".
            extractors.push(PatternKind::Contextual {
                anchor,
                direction: Direction::SameLine,
            });
        }

        if let Some(pattern) = shape_regex(value) {
            if regex_match_count(&pattern, &doc.full_text()) <= MAX_REGEX_MATCHES {
                extractors.push(PatternKind::Regex { pattern });
            }
        }

        FieldPattern { extractors }
    }
}

fn normalise(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The smallest element whose text equals the value.
fn exact_element<'a>(doc: &'a ParsedDocument, value: &str) -> Option<&'a Element> {
    let wanted = normalise(value);
    doc.elements
        .iter()
        .filter(|e| normalise(&e.text) == wanted)
        .min_by(|a, b| {
            a.bbox
                .area()
                .partial_cmp(&b.bbox.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// The smallest element containing the value along with the label text
/// preceding it, when that prefix looks like an anchor.
fn embedded_value<'a>(doc: &'a ParsedDocument, value: &str) -> Option<(&'a Element, String)> {
    let wanted = normalise(value);
    doc.elements
        .iter()
        .filter_map(|e| {
            let text = normalise(&e.text);
            let at = text.find(&wanted)?;
            let prefix = text[..at].trim().to_string();
            if prefix.is_empty() || prefix.split_whitespace().count() > MAX_ANCHOR_TOKENS {
                return None;
            }
            Some((e, prefix))
        })
        .min_by(|a, b| {
            a.0.bbox
                .area()
                .partial_cmp(&b.0.bbox.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Looks for a short label near the value element: same line to the left
/// (value is to the anchor's right), same line to the right, or on the
/// line above (value is below the anchor).
fn neighbouring_anchor(doc: &ParsedDocument, value_element: &Element) -> Option<(String, Direction)> {
    let lines = doc.lines();
    let line_index = lines.iter().position(|line| {
        line.elements
            .iter()
            .any(|e| std::ptr::eq(*e, value_element))
    })?;

    let line = &lines[line_index];
    let position = line
        .elements
        .iter()
        .position(|e| std::ptr::eq(*e, value_element))?;

    if position > 0 {
        let left = line.elements[position - 1];
        if is_anchor_text(&left.text) {
            return Some((left.text.trim().to_string(), Direction::Right));
        }
    }
    if position + 1 < line.elements.len() {
        let right = line.elements[position + 1];
        if is_anchor_text(&right.text) {
            return Some((right.text.trim().to_string(), Direction::SameLine));
        }
    }
    if line_index > 0 {
        let above = &lines[line_index - 1];
        if above.page == line.page {
            let (vx, _) = value_element.bbox.center();
            let nearest = above.elements.iter().min_by(|a, b| {
                let da = (a.bbox.center().0 - vx).abs();
                let db = (b.bbox.center().0 - vx).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })?;
            if is_anchor_text(&nearest.text) {
                return Some((nearest.text.trim().to_string(), Direction::Below));
            }
        }
    }
    None
}

fn is_anchor_text(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && trimmed.split_whitespace().count() <= MAX_ANCHOR_TOKENS
}

/// Builds a character-class regex mirroring the value's shape, e.g.
/// `123.456.789-00` becomes `\d{3}\.\d{3}\.\d{3}\-\d{2}`.
pub(crate) fn shape_regex(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.len() > 120 {
        return None;
    }
    let mut pattern = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            let mut run = 1;
            while chars.peek().map(|n| n.is_ascii_digit()).unwrap_or(false) {
                chars.next();
                run += 1;
            }
            pattern.push_str(&format!("\\d{{{run}}}"));
        } else if c.is_alphabetic() {
            while chars.peek().map(|n| n.is_alphabetic()).unwrap_or(false) {
                chars.next();
            }
            pattern.push_str("\\p{L}+");
        } else if c.is_whitespace() {
            while chars.peek().map(|n| n.is_whitespace()).unwrap_or(false) {
                chars.next();
            }
            pattern.push_str("\\s+");
        } else {
            pattern.push_str(&regex::escape(&c.to_string()));
        }
    }
    // A pattern of bare letter classes matches half the document; only
    // shapes with at least one digit or punctuation literal are worth
    // keeping.
    value.chars().any(|c| !c.is_alphabetic() && !c.is_whitespace())
        .then_some(pattern)
}

fn regex_match_count(pattern: &str, text: &str) -> usize {
    match Regex::new(pattern) {
        Ok(re) => re.find_iter(text).count(),
        Err(_) => usize::MAX,
    }
}

/// Schema keys accumulate; anchors keep the stable intersection unless
/// the documents share nothing, in which case both sets are kept.
fn merge_signatures(
    old: &StructuralSignature,
    new: &StructuralSignature,
) -> StructuralSignature {
    let anchors: std::collections::BTreeSet<String> = old
        .anchor_tokens
        .intersection(&new.anchor_tokens)
        .cloned()
        .collect();
    StructuralSignature {
        schema_keys: old.schema_keys.union(&new.schema_keys).cloned().collect(),
        anchor_tokens: if anchors.is_empty() {
            old.anchor_tokens.union(&new.anchor_tokens).cloned().collect()
        } else {
            anchors
        },
    }
}
