//! Core data model: requests, results, schemas and parsed documents.

use crate::errors::ExtractError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One field the caller wants extracted: a unique name plus a
/// human-readable description the LLM and the shape classifier read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub description: String,
}

/// An ordered mapping from field name to description.
///
/// Order is preserved exactly as supplied (it drives prompt layout and
/// result ordering), but the canonical form used for cache keys sorts the
/// keys so that two requests differing only in field order are the same
/// request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<SchemaField>,
}

impl Schema {
    /// Builds a schema from `(name, description)` pairs, rejecting
    /// duplicate or empty field names.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ExtractError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut fields = Vec::new();
        let mut seen = BTreeSet::new();
        for (name, description) in pairs {
            let name = name.into();
            if name.trim().is_empty() {
                return Err(ExtractError::Validation(
                    "schema field names must be non-empty".to_string(),
                ));
            }
            if !seen.insert(name.clone()) {
                return Err(ExtractError::Validation(format!(
                    "duplicate schema field: {name}"
                )));
            }
            fields.push(SchemaField {
                name,
                description: description.into(),
            });
        }
        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaField> {
        self.fields.iter()
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.description.as_str())
    }

    /// A sub-schema containing only the named fields, original order kept.
    pub fn subset(&self, names: &BTreeSet<String>) -> Schema {
        Schema {
            fields: self
                .fields
                .iter()
                .filter(|f| names.contains(&f.name))
                .cloned()
                .collect(),
        }
    }

    /// Canonical serialisation: keys sorted, values trimmed, no
    /// interstitial whitespace. Two schemas that differ only in field
    /// order canonicalise identically.
    pub fn canonical_json(&self) -> String {
        let mut sorted: Vec<&SchemaField> = self.fields.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let map: serde_json::Map<String, serde_json::Value> = sorted
            .into_iter()
            .map(|f| {
                (
                    f.name.trim().to_string(),
                    serde_json::Value::String(f.description.trim().to_string()),
                )
            })
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for field in &self.fields {
            map.serialize_entry(&field.name, &field.description)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SchemaVisitor;

        impl<'de> Visitor<'de> for SchemaVisitor {
            type Value = Schema;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field name to description")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Schema, A::Error> {
                let mut fields = Vec::new();
                let mut seen = BTreeSet::new();
                while let Some((name, description)) = access.next_entry::<String, String>()? {
                    if !seen.insert(name.clone()) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate schema field: {name}"
                        )));
                    }
                    fields.push(SchemaField { name, description });
                }
                Ok(Schema { fields })
            }
        }

        deserializer.deserialize_map(SchemaVisitor)
    }
}

/// A single extraction request. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub pdf_bytes: Vec<u8>,
    pub label: String,
    pub schema: Schema,
}

impl ExtractionRequest {
    pub fn new(pdf_bytes: Vec<u8>, label: impl Into<String>, schema: Schema) -> Self {
        Self {
            pdf_bytes,
            label: label.into(),
            schema,
        }
    }

    /// Checks the request is well-formed before any work is scheduled.
    pub fn validate(&self) -> Result<(), ExtractError> {
        if self.label.trim().is_empty() {
            return Err(ExtractError::Validation("label must be non-empty".into()));
        }
        if self.schema.is_empty() {
            return Err(ExtractError::Validation(
                "extraction schema must have at least one field".into(),
            ));
        }
        if !self.pdf_bytes.starts_with(b"%PDF") {
            return Err(ExtractError::Validation(
                "payload is not a PDF document".into(),
            ));
        }
        Ok(())
    }
}

/// The execution path that produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    CacheL1,
    CacheL2,
    Template,
    Hybrid,
    Llm,
    Error,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::CacheL1 => "cache_l1",
            Method::CacheL2 => "cache_l2",
            Method::Template => "template",
            Method::Hybrid => "hybrid",
            Method::Llm => "llm",
            Method::Error => "error",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Execution metadata attached to every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub method: Method,
    pub time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_fields: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_fields: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Set on results handed to callers that coalesced onto another
    /// caller's in-flight execution of the same fingerprint.
    #[serde(default, skip_serializing_if = "is_false")]
    pub coalesced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// On failure, the last pipeline stage that was attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_method: Option<Method>,
}

impl ResultMetadata {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            time_seconds: 0.0,
            similarity: None,
            template_fields: None,
            llm_fields: None,
            retries: None,
            coalesced: false,
            warning: None,
            last_method: None,
        }
    }
}

/// The outcome of one extraction. On success, `data` keys are exactly the
/// request's schema keys; a `None` value means the field could not be
/// filled without the extraction failing outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub data: BTreeMap<String, Option<String>>,
    pub metadata: ResultMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    /// A failure result. When the schema is known its keys are preserved
    /// with `None` values so callers can still iterate their fields.
    pub fn failure(
        schema: Option<&Schema>,
        error: impl Into<String>,
        last_method: Option<Method>,
    ) -> Self {
        let data = schema
            .map(|s| s.iter().map(|f| (f.name.clone(), None)).collect())
            .unwrap_or_default();
        let mut metadata = ResultMetadata::new(Method::Error);
        metadata.last_method = last_method;
        Self {
            success: false,
            data,
            metadata,
            error: Some(error.into()),
        }
    }
}

/// Axis-aligned bounding box in the parser's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoundingBox {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f64 {
        (self.x1 - self.x0).abs()
    }

    pub fn height(&self) -> f64 {
        (self.y1 - self.y0).abs()
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x0.min(self.x1)
            && x <= self.x0.max(self.x1)
            && y >= self.y0.min(self.y1)
            && y <= self.y0.max(self.y1)
    }
}

/// Element kind reported by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Paragraph,
    Title,
    ListItem,
    TableCell,
    Other,
}

/// One positioned text fragment of a parsed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub text: String,
    pub page: u32,
    pub bbox: BoundingBox,
    pub kind: ElementKind,
}

/// A visual line: elements on the same page with near-equal vertical
/// centres, ordered left to right.
#[derive(Debug)]
pub struct Line<'a> {
    pub page: u32,
    pub y_center: f64,
    pub elements: Vec<&'a Element>,
}

/// Parser output. The coordinate space is whatever the parser produced;
/// the core never rescales it, it only tags it so positional patterns
/// learned in one space are not applied in another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub coord_space: String,
    pub elements: Vec<Element>,
}

impl ParsedDocument {
    pub fn new(coord_space: impl Into<String>, elements: Vec<Element>) -> Self {
        Self {
            coord_space: coord_space.into(),
            elements,
        }
    }

    /// All element text joined with newlines, in element order.
    pub fn full_text(&self) -> String {
        self.elements
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Element text annotated with page and position, one line per
    /// element. This is the rendering sent to the LLM.
    pub fn annotated_text(&self) -> String {
        self.elements
            .iter()
            .map(|e| {
                format!(
                    "[p{} x={:.1} y={:.1}] {}",
                    e.page, e.bbox.x0, e.bbox.y0, e.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Groups elements into visual lines by near-equal vertical centre.
    pub fn lines(&self) -> Vec<Line<'_>> {
        let mut indexed: Vec<&Element> = self.elements.iter().collect();
        indexed.sort_by(|a, b| {
            (a.page, a.bbox.center().1, a.bbox.x0)
                .partial_cmp(&(b.page, b.bbox.center().1, b.bbox.x0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut lines: Vec<Line> = Vec::new();
        for element in indexed {
            let (_, yc) = element.bbox.center();
            let tolerance = (element.bbox.height() * 0.5).max(1e-6);
            match lines.last_mut() {
                Some(line)
                    if line.page == element.page && (line.y_center - yc).abs() <= tolerance =>
                {
                    line.elements.push(element);
                }
                _ => lines.push(Line {
                    page: element.page,
                    y_center: yc,
                    elements: vec![element],
                }),
            }
        }
        for line in &mut lines {
            line.elements.sort_by(|a, b| {
                a.bbox
                    .x0
                    .partial_cmp(&b.bbox.x0)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        lines
    }
}
