//! Per-label learned templates: representation, persistence, matching,
//! learning and application.

pub mod extractor;
pub mod learner;
pub mod matcher;
pub mod store;

pub use extractor::{ExtractedFields, FieldExtractor};
pub use learner::PatternLearner;
pub use matcher::TemplateMatcher;
pub use store::TemplateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Where a value sits relative to its anchor text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Right,
    Below,
    SameLine,
}

/// One way of locating a field's value. Extractors are tried in the
/// declared order and the first non-empty result wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternKind {
    /// A bounding region in the coordinate space the pattern was learned
    /// in, plus the page it was seen on.
    Positional {
        page: u32,
        x: f64,
        y: f64,
        w: f64,
        h: f64,
    },
    /// A short label printed near the value, with the direction from the
    /// anchor to the value.
    Contextual { anchor: String, direction: Direction },
    /// A shape regex induced from an observed value, applied to the full
    /// document text as a last resort.
    Regex { pattern: String },
}

/// The pattern disjunction learned for a single field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldPattern {
    pub extractors: Vec<PatternKind>,
}

/// What characterises a template: the schema keys it was trained for plus
/// the anchor tokens observed in its training documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuralSignature {
    pub schema_keys: BTreeSet<String>,
    pub anchor_tokens: BTreeSet<String>,
}

impl StructuralSignature {
    fn combined(&self) -> BTreeSet<&str> {
        self.schema_keys
            .iter()
            .map(String::as_str)
            .chain(self.anchor_tokens.iter().map(String::as_str))
            .collect()
    }

    /// Jaccard similarity over the combined key/anchor sets.
    pub fn jaccard(&self, other: &StructuralSignature) -> f64 {
        let a = self.combined();
        let b = other.combined();
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }
        let intersection = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        intersection / union
    }

    /// How much `other` diverges from this signature, in `[0, 1]`.
    pub fn delta(&self, other: &StructuralSignature) -> f64 {
        1.0 - self.jaccard(other)
    }
}

/// A learned per-label template. `label` is not unique: one label may
/// hold several structural variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub label: String,
    pub sample_count: u32,
    pub signature: StructuralSignature,
    pub field_patterns: BTreeMap<String, FieldPattern>,
    /// Exponentially-decayed per-field success rate in `[0, 1]`.
    pub field_confidence: BTreeMap<String, f64>,
    /// Text of the first training document, kept for token/character
    /// similarity scoring.
    pub reference_text: String,
    /// Coordinate-space tag of the parser the positional patterns were
    /// learned with.
    pub coord_space: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn mean_confidence(&self) -> f64 {
        if self.field_confidence.is_empty() {
            return 0.0;
        }
        self.field_confidence.values().sum::<f64>() / self.field_confidence.len() as f64
    }
}
