//! Pipeline configuration with defaults matching production behaviour.
//!
//! Every section implements `Default` and deserialises from a partial
//! document, so callers can override a single knob without restating the
//! rest.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for an [`crate::ExtractionPipeline`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub template: TemplateConfig,
    pub batch: BatchConfig,
    pub llm: LlmConfig,
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 in-memory LRU bound, in entries.
    pub l1_capacity: usize,
    /// Directory holding the persistent L2 entries.
    pub l2_dir: PathBuf,
    /// Disk quota for L2, in bytes.
    pub l2_max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 100,
            l2_dir: PathBuf::from("./extrato_cache"),
            l2_max_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// SQLite file backing the template store. `:memory:` is valid.
    pub db_path: String,
    /// Minimum document similarity before a template may be applied.
    pub similarity_threshold: f64,
    /// Minimum per-field confidence before a field is extracted without
    /// LLM fallback.
    pub confidence_threshold: f64,
    /// Minimum learning samples before a template may be consulted.
    pub min_samples: u32,
    /// Per-label template cap; overflow evicts the weakest template.
    pub max_per_label: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            db_path: "./extrato_templates.db".to_string(),
            similarity_threshold: 0.70,
            confidence_threshold: 0.80,
            min_samples: 2,
            max_per_label: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Concurrency ceiling across label groups.
    pub max_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub timeout_s: u64,
    /// Extra attempts after the first failure, with exponential backoff
    /// starting at one second.
    pub max_retries: u32,
    /// Language/region hint forwarded to the provider.
    pub language_hint: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_s: 120,
            max_retries: 1,
            language_hint: "português brasileiro (pt-BR)".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub timeout_s: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self { timeout_s: 30 }
    }
}

impl ParserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}
