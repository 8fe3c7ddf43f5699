//! # Common Test Utilities
//!
//! Shared harness for the integration suite: a scripted fake parser and
//! fake AI provider, document builders for a Brazilian OAB-card layout,
//! and a factory that assembles a pipeline on temporary storage.

// Allow unused code because this is a test utility module, and not all
// helpers are used by every test file that includes it.
#![allow(unused)]

pub mod pdf_helper;

use async_trait::async_trait;
use extrato::{
    AiConstraints, AiExtractor, DocumentParser, ExtractError, ExtractionPipeline,
    ExtractionRequest, FieldMap, ParsedDocument, PipelineConfig, Schema,
};
use extrato::types::{BoundingBox, Element, ElementKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .try_init();
}

/// Fake PDF payloads only need the magic prefix to pass validation; the
/// tag keeps fingerprints distinct.
pub fn pdf_bytes(tag: &str) -> Vec<u8> {
    format!("%PDF-1.4\n{tag}").into_bytes()
}

pub fn element(text: &str, x: f64, y: f64) -> Element {
    Element {
        text: text.to_string(),
        page: 0,
        bbox: BoundingBox::new(x, y, x + 0.25, y + 0.04),
        kind: ElementKind::Paragraph,
    }
}

/// A fake OAB card. The boilerplate labels are fixed so two cards of the
/// same class score well above the similarity threshold.
pub fn oab_doc(nome: &str, inscricao: &str) -> ParsedDocument {
    let mut doc = oab_doc_without_seccional(nome, inscricao);
    doc.elements.push(element("São Paulo", 0.4, 0.5));
    doc
}

/// Same layout, but the seccional value is absent (its label remains),
/// which forces the hybrid path for that field.
pub fn oab_doc_without_seccional(nome: &str, inscricao: &str) -> ParsedDocument {
    ParsedDocument::new(
        "fake",
        vec![
            element("Ordem dos Advogados do Brasil", 0.1, 0.1),
            element("Conselho Federal", 0.1, 0.14),
            element("Carteira de Identidade de Advogado", 0.1, 0.18),
            element("Documento de identificação profissional", 0.1, 0.22),
            element("Nome:", 0.1, 0.3),
            element(nome, 0.4, 0.3),
            element("Inscrição:", 0.1, 0.4),
            element(inscricao, 0.4, 0.4),
            element("Seccional:", 0.1, 0.5),
            element("Subseção:", 0.1, 0.55),
            element("Capital", 0.4, 0.55),
            element("Categoria:", 0.1, 0.6),
            element("Advogado", 0.4, 0.6),
            element("Situação: Regular", 0.1, 0.7),
            element("Válida em todo o território nacional", 0.1, 0.8),
        ],
    )
}

/// A fake system-screen capture, structurally unrelated to the OAB card.
pub fn tela_doc(sistema: &str, produto: &str) -> ParsedDocument {
    ParsedDocument::new(
        "fake",
        vec![
            element("Tela do Sistema de Faturamento", 0.1, 0.1),
            element("Sistema:", 0.1, 0.3),
            element(sistema, 0.4, 0.3),
            element("Produto:", 0.1, 0.4),
            element(produto, 0.4, 0.4),
            element("Referência: 2024", 0.1, 0.5),
        ],
    )
}

pub fn oab_schema() -> Schema {
    Schema::from_pairs([
        ("nome", "Nome completo do advogado"),
        ("inscricao", "Inscrição na OAB"),
    ])
    .unwrap()
}

pub fn oab_schema_with_seccional() -> Schema {
    Schema::from_pairs([
        ("nome", "Nome completo do advogado"),
        ("inscricao", "Inscrição na OAB"),
        ("seccional", "Seccional da OAB"),
    ])
    .unwrap()
}

pub fn tela_schema() -> Schema {
    Schema::from_pairs([("sistema", "Sistema de origem"), ("produto", "Produto exibido")])
        .unwrap()
}

// --- Fake parser ---

/// Serves pre-registered parsed documents by payload; anything else is a
/// parse failure.
#[derive(Clone, Debug, Default)]
pub struct FakeParser {
    docs: Arc<Mutex<HashMap<Vec<u8>, ParsedDocument>>>,
}

impl FakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bytes: &[u8], doc: ParsedDocument) {
        self.docs.lock().unwrap().insert(bytes.to_vec(), doc);
    }
}

#[async_trait]
impl DocumentParser for FakeParser {
    async fn parse(&self, pdf_bytes: &[u8]) -> Result<ParsedDocument, ExtractError> {
        self.docs
            .lock()
            .unwrap()
            .get(pdf_bytes)
            .cloned()
            .ok_or_else(|| ExtractError::Parse("unreadable test document".to_string()))
    }
}

// --- Fake AI provider ---

/// Answers extraction calls from a mutable answer table, with optional
/// scripted failures and latency. Counts every invocation and records
/// the schema keys of each call.
#[derive(Clone, Debug, Default)]
pub struct FakeAi {
    answers: Arc<Mutex<BTreeMap<String, String>>>,
    calls: Arc<AtomicUsize>,
    failures_remaining: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
    schemas_seen: Arc<Mutex<Vec<Vec<String>>>>,
}

impl FakeAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_answers<I, K, V>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut answers = self.answers.lock().unwrap();
        answers.clear();
        for (k, v) in pairs {
            answers.insert(k.into(), v.into());
        }
    }

    /// The next `n` invocations fail with a provider error.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn schemas_seen(&self) -> Vec<Vec<String>> {
        self.schemas_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiExtractor for FakeAi {
    async fn extract_fields(
        &self,
        _document: &ParsedDocument,
        schema: &Schema,
        _constraints: &AiConstraints,
    ) -> Result<FieldMap, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.schemas_seen.lock().unwrap().push(
            schema
                .field_names()
                .into_iter()
                .map(String::from)
                .collect(),
        );

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExtractError::AiApi("simulated provider outage".to_string()));
        }

        let answers = self.answers.lock().unwrap();
        Ok(schema
            .iter()
            .map(|f| (f.name.clone(), answers.get(&f.name).cloned()))
            .collect())
    }
}

// --- Pipeline factory ---

pub struct TestPipeline {
    pub pipeline: Arc<ExtractionPipeline>,
    pub parser: FakeParser,
    pub ai: FakeAi,
    _tmp: TempDir,
}

impl TestPipeline {
    pub async fn spawn() -> Self {
        Self::spawn_with(PipelineConfig::default()).await
    }

    pub async fn spawn_with(mut config: PipelineConfig) -> Self {
        init_tracing();
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        config.cache.l2_dir = tmp.path().join("cache");
        config.template.db_path = tmp
            .path()
            .join("templates.db")
            .to_str()
            .expect("utf-8 temp path")
            .to_string();

        let parser = FakeParser::new();
        let ai = FakeAi::new();
        let pipeline = ExtractionPipeline::builder()
            .parser(Box::new(parser.clone()))
            .ai_provider(Box::new(ai.clone()))
            .config(config)
            .build()
            .await
            .expect("failed to build pipeline");

        Self {
            pipeline: Arc::new(pipeline),
            parser,
            ai,
            _tmp: tmp,
        }
    }

    pub fn request(&self, tag: &str, label: &str, schema: Schema) -> ExtractionRequest {
        ExtractionRequest::new(pdf_bytes(tag), label, schema)
    }
}
