//! Applies learned patterns to a parsed document.
//!
//! For each schema field the pattern disjunction is tried in order
//! (positional, then contextual, then regex) and the first non-empty
//! candidate wins. Every candidate then passes the shape validator; a
//! rejected candidate leaves the field missing.

use crate::template::{Direction, FieldPattern, PatternKind, Template};
use crate::types::{ParsedDocument, Schema};
use crate::validate;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Positional regions are extended by this fraction of their size on each
/// side before candidates are collected.
const REGION_SLACK: f64 = 0.10;
/// A shape regex is trusted only while it stays this selective.
const MAX_REGEX_MATCHES: usize = 3;

/// Per-field extraction outcome for one document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub values: BTreeMap<String, Option<String>>,
    pub fields_filled: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct FieldExtractor;

impl FieldExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Runs every schema field through the template's patterns.
    pub fn extract(
        &self,
        doc: &ParsedDocument,
        template: &Template,
        schema: &Schema,
    ) -> ExtractedFields {
        let mut out = ExtractedFields::default();
        for field in schema.iter() {
            let raw = template
                .field_patterns
                .get(&field.name)
                .and_then(|pattern| self.apply(pattern, doc, &template.coord_space));
            let value = raw.and_then(|raw| {
                let hint = validate::shape_hint(&field.name, &field.description);
                validate::validate(hint, &raw)
            });
            if let Some(value) = &value {
                trace!(field = %field.name, value, "Template filled field");
                out.fields_filled.insert(field.name.clone());
            }
            out.values.insert(field.name.clone(), value);
        }
        out
    }

    /// Tries the extractors of one pattern in order.
    pub(crate) fn apply(
        &self,
        pattern: &FieldPattern,
        doc: &ParsedDocument,
        coord_space: &str,
    ) -> Option<String> {
        for kind in &pattern.extractors {
            let candidate = match kind {
                PatternKind::Positional { page, x, y, w, h } => {
                    self.by_position(doc, coord_space, *page, *x, *y, *w, *h)
                }
                PatternKind::Contextual { anchor, direction } => {
                    self.by_context(doc, anchor, *direction)
                }
                PatternKind::Regex { pattern } => self.by_regex(doc, pattern),
            };
            if let Some(candidate) = candidate {
                let trimmed = candidate.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn by_position(
        &self,
        doc: &ParsedDocument,
        coord_space: &str,
        page: u32,
        x: f64,
        y: f64,
        w: f64,
        h: f64,
    ) -> Option<String> {
        // A region is only meaningful in the space it was learned in.
        if doc.coord_space != coord_space {
            return None;
        }
        let x0 = x - w * REGION_SLACK;
        let y0 = y - h * REGION_SLACK;
        let x1 = x + w * (1.0 + REGION_SLACK);
        let y1 = y + h * (1.0 + REGION_SLACK);

        doc.elements
            .iter()
            .filter(|e| e.page == page)
            .filter(|e| {
                let (cx, cy) = e.bbox.center();
                cx >= x0 && cx <= x1 && cy >= y0 && cy <= y1
            })
            .min_by(|a, b| {
                a.bbox
                    .area()
                    .partial_cmp(&b.bbox.area())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|e| e.text.clone())
    }

    fn by_context(
        &self,
        doc: &ParsedDocument,
        anchor: &str,
        direction: Direction,
    ) -> Option<String> {
        let folded_anchor = anchor.trim().to_lowercase();
        if folded_anchor.is_empty() {
            return None;
        }
        let lines = doc.lines();

        for (line_index, line) in lines.iter().enumerate() {
            for (position, element) in line.elements.iter().enumerate() {
                let folded = element.text.trim().to_lowercase();
                if !folded.contains(&folded_anchor) {
                    continue;
                }

                // The value may share the anchor's element ("Nome: João").
                if direction != Direction::Below {
                    let original = element.text.trim();
                    if let Some(at) = original.find(anchor.trim()) {
                        let tail = original[at + anchor.trim().len()..].trim();
                        if !tail.is_empty() {
                            return Some(tail.to_string());
                        }
                    }
                }

                match direction {
                    Direction::Right => {
                        if let Some(next) = line.elements.get(position + 1) {
                            return Some(next.text.clone());
                        }
                    }
                    Direction::SameLine => {
                        let neighbour = line
                            .elements
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i != position)
                            .min_by_key(|(i, _)| i.abs_diff(position))
                            .map(|(_, e)| e.text.clone());
                        if let Some(neighbour) = neighbour {
                            return Some(neighbour);
                        }
                    }
                    Direction::Below => {
                        let below = lines
                            .get(line_index + 1)
                            .filter(|next| next.page == line.page);
                        if let Some(below) = below {
                            let (ax, _) = element.bbox.center();
                            let nearest = below.elements.iter().min_by(|a, b| {
                                let da = (a.bbox.center().0 - ax).abs();
                                let db = (b.bbox.center().0 - ax).abs();
                                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                            });
                            if let Some(nearest) = nearest {
                                return Some(nearest.text.clone());
                            }
                        }
                    }
                }
            }
        }
        None
    }

    fn by_regex(&self, doc: &ParsedDocument, pattern: &str) -> Option<String> {
        let re = Regex::new(pattern).ok()?;
        let text = doc.full_text();
        let matches: Vec<&str> = re
            .find_iter(&text)
            .take(MAX_REGEX_MATCHES + 1)
            .map(|m| m.as_str())
            .collect();
        if matches.is_empty() || matches.len() > MAX_REGEX_MATCHES {
            return None;
        }
        Some(matches[0].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Element, ElementKind};
    use chrono::Utc;
    use uuid::Uuid;

    fn element(text: &str, x: f64, y: f64) -> Element {
        Element {
            text: text.to_string(),
            page: 0,
            bbox: BoundingBox::new(x, y, x + 0.25, y + 0.04),
            kind: ElementKind::Paragraph,
        }
    }

    fn doc() -> ParsedDocument {
        ParsedDocument::new(
            "test",
            vec![
                element("Nome:", 0.1, 0.2),
                element("João Silva", 0.4, 0.2),
                element("Inscrição:", 0.1, 0.3),
                element("123456", 0.4, 0.3),
            ],
        )
    }

    fn template_with(field: &str, pattern: FieldPattern) -> Template {
        Template {
            id: Uuid::new_v4(),
            label: "oab".into(),
            sample_count: 2,
            signature: Default::default(),
            field_patterns: [(field.to_string(), pattern)].into(),
            field_confidence: [(field.to_string(), 1.0)].into(),
            reference_text: String::new(),
            coord_space: "test".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn positional_match_within_slack() {
        let extractor = FieldExtractor::new();
        let pattern = FieldPattern {
            extractors: vec![PatternKind::Positional {
                page: 0,
                x: 0.4,
                y: 0.2,
                w: 0.25,
                h: 0.04,
            }],
        };
        assert_eq!(
            extractor.apply(&pattern, &doc(), "test"),
            Some("João Silva".to_string())
        );
    }

    #[test]
    fn positional_refuses_foreign_coordinate_space() {
        let extractor = FieldExtractor::new();
        let pattern = FieldPattern {
            extractors: vec![PatternKind::Positional {
                page: 0,
                x: 0.4,
                y: 0.2,
                w: 0.25,
                h: 0.04,
            }],
        };
        assert_eq!(extractor.apply(&pattern, &doc(), "pixels"), None);
    }

    #[test]
    fn contextual_right_takes_next_element_on_the_line() {
        let extractor = FieldExtractor::new();
        let pattern = FieldPattern {
            extractors: vec![PatternKind::Contextual {
                anchor: "Inscrição:".into(),
                direction: Direction::Right,
            }],
        };
        assert_eq!(
            extractor.apply(&pattern, &doc(), "test"),
            Some("123456".to_string())
        );
    }

    #[test]
    fn contextual_reads_value_embedded_after_anchor() {
        let extractor = FieldExtractor::new();
        let doc = ParsedDocument::new("test", vec![element("CPF: 987.654.321-00", 0.1, 0.2)]);
        let pattern = FieldPattern {
            extractors: vec![PatternKind::Contextual {
                anchor: "CPF:".into(),
                direction: Direction::SameLine,
            }],
        };
        assert_eq!(
            extractor.apply(&pattern, &doc, "test"),
            Some("987.654.321-00".to_string())
        );
    }

    #[test]
    fn contextual_below_picks_nearest_on_next_line() {
        let extractor = FieldExtractor::new();
        let doc = ParsedDocument::new(
            "test",
            vec![
                element("Seccional", 0.1, 0.2),
                element("São Paulo", 0.1, 0.3),
                element("Capital", 0.6, 0.3),
            ],
        );
        let pattern = FieldPattern {
            extractors: vec![PatternKind::Contextual {
                anchor: "Seccional".into(),
                direction: Direction::Below,
            }],
        };
        assert_eq!(
            extractor.apply(&pattern, &doc, "test"),
            Some("São Paulo".to_string())
        );
    }

    #[test]
    fn regex_is_rejected_when_too_many_matches() {
        let extractor = FieldExtractor::new();
        let doc = ParsedDocument::new(
            "test",
            vec![
                element("111.111.111-11", 0.1, 0.1),
                element("222.222.222-22", 0.1, 0.2),
                element("333.333.333-33", 0.1, 0.3),
                element("444.444.444-44", 0.1, 0.4),
            ],
        );
        let pattern = FieldPattern {
            extractors: vec![PatternKind::Regex {
                pattern: r"\d{3}\.\d{3}\.\d{3}\-\d{2}".into(),
            }],
        };
        assert_eq!(extractor.apply(&pattern, &doc, "test"), None);
    }

    #[test]
    fn extract_validates_and_reports_filled_fields() {
        let extractor = FieldExtractor::new();
        let schema = Schema::from_pairs([
            ("nome", "Nome completo"),
            ("inscricao", "Número de inscrição"),
        ])
        .unwrap();
        let mut template = template_with(
            "nome",
            FieldPattern {
                extractors: vec![PatternKind::Contextual {
                    anchor: "Nome:".into(),
                    direction: Direction::Right,
                }],
            },
        );
        template.field_patterns.insert(
            "inscricao".to_string(),
            FieldPattern {
                extractors: vec![PatternKind::Contextual {
                    anchor: "Inscrição:".into(),
                    direction: Direction::Right,
                }],
            },
        );
        let out = extractor.extract(&doc(), &template, &schema);
        assert_eq!(out.values["nome"], Some("João Silva".to_string()));
        assert_eq!(out.values["inscricao"], Some("123456".to_string()));
        assert_eq!(out.fields_filled.len(), 2);
    }
}
