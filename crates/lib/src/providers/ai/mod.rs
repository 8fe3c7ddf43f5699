pub mod openai;

use crate::errors::ExtractError;
use crate::types::{ParsedDocument, Schema};
use async_trait::async_trait;
use dyn_clone::DynClone;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Field values as returned by a provider: `None` when the document does
/// not contain the field.
pub type FieldMap = BTreeMap<String, Option<String>>;

/// Constraints forwarded with every extraction call.
#[derive(Debug, Clone)]
pub struct AiConstraints {
    /// The caller's document class, included in the prompt.
    pub label: String,
    /// Language/region hint, default Brazilian Portuguese.
    pub language_hint: String,
}

/// A trait for LLM-backed field extraction.
///
/// Implementations receive the parsed document and the (possibly
/// reduced) schema, and must return a JSON-object-shaped mapping with
/// exactly the requested fields. A malformed provider response is a
/// retryable error.
#[async_trait]
pub trait AiExtractor: Send + Sync + Debug + DynClone {
    async fn extract_fields(
        &self,
        document: &ParsedDocument,
        schema: &Schema,
        constraints: &AiConstraints,
    ) -> Result<FieldMap, ExtractError>;
}

dyn_clone::clone_trait_object!(AiExtractor);
