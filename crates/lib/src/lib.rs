//! # extrato
//!
//! Hybrid field extraction from PDF documents. Each request carries a
//! PDF, a document-class label and an extraction schema; the pipeline
//! answers from a two-tier response cache when it can, applies a learned
//! per-label template when one matches well enough, falls back to an LLM
//! for whatever the template cannot fill, and learns new templates from
//! every full LLM extraction. A batch scheduler drives many requests at
//! once, serialising per label (so learning compounds) and parallelising
//! across labels, streaming per-item results as they finish.

pub mod batch;
pub mod cache;
pub mod config;
pub mod errors;
pub mod fingerprint;
pub mod pipeline;
pub mod providers;
pub mod template;
pub mod types;
pub mod validate;

pub use batch::{BatchEvent, BatchScheduler, BatchStats};
pub use cache::{CacheManager, CacheSource, CacheStats};
pub use config::PipelineConfig;
pub use errors::ExtractError;
pub use fingerprint::Fingerprint;
pub use pipeline::{
    CancelHandle, CancelToken, ExtractionPipeline, ExtractionPipelineBuilder, PipelineStats,
};
pub use providers::ai::{openai::OpenAiExtractor, AiConstraints, AiExtractor, FieldMap};
pub use providers::parser::{pdf_text::PdfTextParser, DocumentParser};
pub use template::{Template, TemplateStore};
pub use types::{
    ExtractionRequest, ExtractionResult, Method, ParsedDocument, ResultMetadata, Schema,
};
