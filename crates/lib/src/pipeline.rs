//! The extraction pipeline: cache → template → hybrid → LLM → learn →
//! store.
//!
//! Concurrency contract: for any fingerprint at most one caller executes
//! the parse/match/LLM stages; everyone else coalesces onto that caller's
//! in-flight result. Learning writes are serialised per label, so a
//! label's sample *k* is fully persisted before sample *k+1* consults the
//! store.

use crate::cache::{CacheManager, CacheSource, CacheStats};
use crate::config::PipelineConfig;
use crate::errors::ExtractError;
use crate::fingerprint::Fingerprint;
use crate::providers::ai::{AiConstraints, AiExtractor, FieldMap};
use crate::providers::parser::DocumentParser;
use crate::template::{FieldExtractor, PatternLearner, TemplateMatcher, TemplateStore};
use crate::types::{
    ExtractionRequest, ExtractionResult, Method, ParsedDocument, ResultMetadata, Schema,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

/// Cancels the extraction(s) holding the matching [`CancelToken`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// A cooperative cancellation signal threaded through blocking calls.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire.
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelToken { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation fires; pends forever on a [`none`]
    /// token whose handle is gone.
    ///
    /// [`none`]: CancelToken::none
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

type InflightMap = HashMap<Fingerprint, watch::Receiver<Option<ExtractionResult>>>;

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    cache_l1_hits: AtomicU64,
    cache_l2_hits: AtomicU64,
    template_hits: AtomicU64,
    hybrid_extractions: AtomicU64,
    llm_calls: AtomicU64,
    llm_micros: AtomicU64,
}

/// A point-in-time snapshot of pipeline activity.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub uptime_seconds: f64,
    pub total_requests: u64,
    pub cache_l1_hits: u64,
    pub cache_l2_hits: u64,
    pub template_hits: u64,
    pub hybrid_extractions: u64,
    pub llm_calls: u64,
    pub llm_seconds: f64,
    pub avg_llm_seconds: f64,
    pub cache: CacheStats,
}

/// Builder for [`ExtractionPipeline`], in the spirit of a client builder:
/// providers are required, everything else has defaults.
#[derive(Default)]
pub struct ExtractionPipelineBuilder {
    parser: Option<Box<dyn DocumentParser>>,
    ai: Option<Box<dyn AiExtractor>>,
    config: PipelineConfig,
}

impl ExtractionPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parser(mut self, parser: Box<dyn DocumentParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn ai_provider(mut self, ai: Box<dyn AiExtractor>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens the cache directory and the template database.
    pub async fn build(self) -> Result<ExtractionPipeline, ExtractError> {
        let parser = self
            .parser
            .ok_or_else(|| ExtractError::Validation("a document parser is required".into()))?;
        let ai = self
            .ai
            .ok_or_else(|| ExtractError::Validation("an AI provider is required".into()))?;

        let cache = CacheManager::open(&self.config.cache).await?;
        let templates = TemplateStore::open(
            &self.config.template.db_path,
            self.config.template.max_per_label,
        )
        .await?;
        let matcher = TemplateMatcher::new(
            self.config.template.similarity_threshold,
            self.config.template.min_samples,
        );

        Ok(ExtractionPipeline {
            config: self.config,
            parser,
            ai,
            cache,
            templates,
            matcher,
            extractor: FieldExtractor::new(),
            learner: PatternLearner::new(),
            inflight: StdMutex::new(HashMap::new()),
            label_locks: StdMutex::new(HashMap::new()),
            counters: Counters::default(),
            started_at: Instant::now(),
        })
    }
}

pub struct ExtractionPipeline {
    config: PipelineConfig,
    parser: Box<dyn DocumentParser>,
    ai: Box<dyn AiExtractor>,
    cache: CacheManager,
    templates: TemplateStore,
    matcher: TemplateMatcher,
    extractor: FieldExtractor,
    learner: PatternLearner,
    inflight: StdMutex<InflightMap>,
    label_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    counters: Counters,
    started_at: Instant,
}

/// Removes the in-flight entry for a fingerprint when its leader is done
/// (or dropped mid-flight), so followers can take over.
struct InflightGuard<'a> {
    inflight: &'a StdMutex<InflightMap>,
    key: Fingerprint,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.inflight.lock() {
            map.remove(&self.key);
        }
    }
}

impl ExtractionPipeline {
    pub fn builder() -> ExtractionPipelineBuilder {
        ExtractionPipelineBuilder::new()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Read access to the template store, mainly for inspection tooling.
    pub fn template_store(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stats(&self) -> PipelineStats {
        let llm_calls = self.counters.llm_calls.load(Ordering::Relaxed);
        let llm_seconds = self.counters.llm_micros.load(Ordering::Relaxed) as f64 / 1e6;
        PipelineStats {
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            cache_l1_hits: self.counters.cache_l1_hits.load(Ordering::Relaxed),
            cache_l2_hits: self.counters.cache_l2_hits.load(Ordering::Relaxed),
            template_hits: self.counters.template_hits.load(Ordering::Relaxed),
            hybrid_extractions: self.counters.hybrid_extractions.load(Ordering::Relaxed),
            llm_calls,
            llm_seconds,
            avg_llm_seconds: llm_seconds / llm_calls.max(1) as f64,
            cache: self.cache.stats(),
        }
    }

    /// Extracts the schema's fields from one PDF. Failures are encoded in
    /// the result, never raised.
    pub async fn extract(&self, request: ExtractionRequest) -> ExtractionResult {
        self.extract_cancellable(request, CancelToken::none()).await
    }

    /// [`extract`](Self::extract) with an external cancellation signal
    /// that propagates into the parser and LLM calls.
    #[instrument(skip_all, fields(label = %request.label))]
    pub async fn extract_cancellable(
        &self,
        request: ExtractionRequest,
        cancel: CancelToken,
    ) -> ExtractionResult {
        let started = Instant::now();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = request.validate() {
            return finish(
                ExtractionResult::failure(Some(&request.schema), e.to_string(), None),
                started,
            );
        }

        let key = Fingerprint::compute(&request.pdf_bytes, &request.label, &request.schema);

        loop {
            enum Role {
                Leader(watch::Sender<Option<ExtractionResult>>),
                Follower(watch::Receiver<Option<ExtractionResult>>),
            }

            let role = {
                let mut inflight = match self.inflight.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(rx) = inflight.get(&key) {
                    Role::Follower(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key, rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    match rx.wait_for(|result| result.is_some()).await {
                        Ok(published) => {
                            let Some(result) = published.as_ref() else {
                                continue;
                            };
                            let mut result = result.clone();
                            result.metadata.coalesced = true;
                            result.metadata.time_seconds = started.elapsed().as_secs_f64();
                            return result;
                        }
                        Err(_) => {
                            // The leader vanished without publishing. Its
                            // guard drops before its sender, so the stale
                            // entry is already gone; retry as the leader.
                            continue;
                        }
                    }
                }
                Role::Leader(tx) => {
                    let _guard = InflightGuard {
                        inflight: &self.inflight,
                        key,
                    };
                    let result = self.run_pipeline(&request, key, &cancel, started).await;
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        request: &ExtractionRequest,
        key: Fingerprint,
        cancel: &CancelToken,
        started: Instant,
    ) -> ExtractionResult {
        // Step 1: response cache.
        if let Some((mut result, source)) = self.cache.get(key).await {
            result.metadata.method = match source {
                CacheSource::L1 => {
                    self.counters.cache_l1_hits.fetch_add(1, Ordering::Relaxed);
                    Method::CacheL1
                }
                CacheSource::L2 => {
                    self.counters.cache_l2_hits.fetch_add(1, Ordering::Relaxed);
                    Method::CacheL2
                }
            };
            result.metadata.coalesced = false;
            return finish(result, started);
        }

        // Step 2: parse.
        let doc = match self.parse_document(&request.pdf_bytes, cancel).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Parse stage failed: {e}");
                return finish(
                    ExtractionResult::failure(Some(&request.schema), e.to_string(), None),
                    started,
                );
            }
        };

        // Step 3: template matching. Store trouble is demoted to "no
        // templates", never to a failed request.
        let candidates = match self.templates.list(&request.label).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Template lookup failed: {e}; continuing without templates");
                Vec::new()
            }
        };

        if let Some((index, similarity)) = self.matcher.best_match(&doc, &candidates) {
            let template = &candidates[index];
            let extracted = self.extractor.extract(&doc, template, &request.schema);

            let mut template_fields = BTreeSet::new();
            let mut missing_fields = BTreeSet::new();
            for field in request.schema.iter() {
                let filled = extracted.fields_filled.contains(&field.name);
                let confident = template
                    .field_confidence
                    .get(&field.name)
                    .copied()
                    .unwrap_or(0.0)
                    >= self.config.template.confidence_threshold;
                if filled && confident {
                    template_fields.insert(field.name.clone());
                } else {
                    missing_fields.insert(field.name.clone());
                }
            }

            // Step 4: template-only or hybrid.
            if missing_fields.is_empty() {
                info!(
                    template_id = %template.id,
                    similarity,
                    "Template filled every field"
                );
                self.counters.template_hits.fetch_add(1, Ordering::Relaxed);
                let mut metadata = ResultMetadata::new(Method::Template);
                metadata.similarity = Some(similarity);
                metadata.template_fields = Some(template_fields.len());
                let result = ExtractionResult {
                    success: true,
                    data: extracted.values,
                    metadata,
                    error: None,
                };
                return self.store_and_finish(key, result, started).await;
            }

            // Hybrid: the LLM is asked only for what the template could
            // not fill, which may be the whole schema.
            let reduced = request.schema.subset(&missing_fields);
            match self.call_llm(&doc, &reduced, &request.label, cancel).await {
                Ok((llm_values, retries)) => {
                    self.counters
                        .hybrid_extractions
                        .fetch_add(1, Ordering::Relaxed);
                    let mut data = BTreeMap::new();
                    for field in request.schema.iter() {
                        let value = if template_fields.contains(&field.name) {
                            extracted.values.get(&field.name).cloned().flatten()
                        } else {
                            llm_values.get(&field.name).cloned().flatten()
                        };
                        data.insert(field.name.clone(), value);
                    }
                    let mut metadata = ResultMetadata::new(Method::Hybrid);
                    metadata.similarity = Some(similarity);
                    metadata.template_fields = Some(template_fields.len());
                    metadata.llm_fields = Some(missing_fields.len());
                    metadata.retries = (retries > 0).then_some(retries);
                    let result = ExtractionResult {
                        success: true,
                        data,
                        metadata,
                        error: None,
                    };
                    return self.store_and_finish(key, result, started).await;
                }
                Err(ExtractError::Cancelled) => {
                    return finish(
                        ExtractionResult::failure(
                            Some(&request.schema),
                            ExtractError::Cancelled.to_string(),
                            Some(Method::Hybrid),
                        ),
                        started,
                    );
                }
                Err(e) if !template_fields.is_empty() => {
                    // Degrade to the template's partial answer.
                    warn!("Hybrid LLM fallback failed: {e}; keeping template fields");
                    self.counters.template_hits.fetch_add(1, Ordering::Relaxed);
                    let mut data = BTreeMap::new();
                    for field in request.schema.iter() {
                        let value = if template_fields.contains(&field.name) {
                            extracted.values.get(&field.name).cloned().flatten()
                        } else {
                            None
                        };
                        data.insert(field.name.clone(), value);
                    }
                    let mut metadata = ResultMetadata::new(Method::Template);
                    metadata.similarity = Some(similarity);
                    metadata.template_fields = Some(template_fields.len());
                    metadata.warning =
                        Some(format!("LLM fallback for missing fields failed: {e}"));
                    let result = ExtractionResult {
                        success: true,
                        data,
                        metadata,
                        error: None,
                    };
                    return self.store_and_finish(key, result, started).await;
                }
                Err(e) => {
                    // Full failure: the template filled nothing and the
                    // reduced call is exhausted, so fall through to the
                    // full-schema attempt below.
                    warn!("Hybrid LLM call failed with no template fields: {e}");
                }
            }
        }

        // Step 5: full LLM.
        match self
            .call_llm(&doc, &request.schema, &request.label, cancel)
            .await
        {
            Ok((llm_values, retries)) => {
                let mut data = BTreeMap::new();
                for field in request.schema.iter() {
                    data.insert(
                        field.name.clone(),
                        llm_values.get(&field.name).cloned().flatten(),
                    );
                }

                // Step 6: learn, serialised with other writers of this
                // label.
                self.learn(&request.label, &doc, &request.schema, &data)
                    .await;

                let mut metadata = ResultMetadata::new(Method::Llm);
                metadata.retries = (retries > 0).then_some(retries);
                let result = ExtractionResult {
                    success: true,
                    data,
                    metadata,
                    error: None,
                };
                self.store_and_finish(key, result, started).await
            }
            Err(e) => {
                warn!("LLM stage failed: {e}");
                finish(
                    ExtractionResult::failure(
                        Some(&request.schema),
                        e.to_string(),
                        Some(Method::Llm),
                    ),
                    started,
                )
            }
        }
    }

    async fn parse_document(
        &self,
        pdf_bytes: &[u8],
        cancel: &CancelToken,
    ) -> Result<ParsedDocument, ExtractError> {
        let parser_timeout = self.config.parser.timeout();
        tokio::select! {
            _ = cancel.cancelled() => Err(ExtractError::Cancelled),
            parsed = timeout(parser_timeout, self.parser.parse(pdf_bytes)) => match parsed {
                Ok(result) => result,
                Err(_) => Err(ExtractError::Timeout("parser", parser_timeout)),
            },
        }
    }

    /// One LLM call with the configured timeout and retry budget
    /// (exponential backoff from one second). Returns the field map and
    /// how many retries were spent.
    async fn call_llm(
        &self,
        doc: &ParsedDocument,
        schema: &Schema,
        label: &str,
        cancel: &CancelToken,
    ) -> Result<(FieldMap, u32), ExtractError> {
        let constraints = AiConstraints {
            label: label.to_string(),
            language_hint: self.config.llm.language_hint.clone(),
        };
        let llm_timeout = self.config.llm.timeout();
        let mut backoff = Duration::from_secs(1);
        let mut retries = 0u32;

        loop {
            self.counters.llm_calls.fetch_add(1, Ordering::Relaxed);
            let attempt_started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(ExtractError::Cancelled),
                attempt = timeout(llm_timeout, self.ai.extract_fields(doc, schema, &constraints)) => {
                    match attempt {
                        Ok(result) => result,
                        Err(_) => Err(ExtractError::Timeout("llm", llm_timeout)),
                    }
                }
            };
            self.counters.llm_micros.fetch_add(
                attempt_started.elapsed().as_micros() as u64,
                Ordering::Relaxed,
            );

            match outcome {
                Ok(map) => return Ok((map, retries)),
                Err(ExtractError::Cancelled) => return Err(ExtractError::Cancelled),
                Err(e) if retries < self.config.llm.max_retries => {
                    warn!("LLM call failed ({e}); retrying in {backoff:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ExtractError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff *= 2;
                    retries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Folds a full-LLM result into the label's templates. Write access
    /// is serialised per label; store trouble is logged, never raised.
    async fn learn(
        &self,
        label: &str,
        doc: &ParsedDocument,
        schema: &Schema,
        data: &BTreeMap<String, Option<String>>,
    ) {
        let lock = {
            let mut locks = match self.label_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(label.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let candidates = match self.templates.list(label).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Skipping learning; template list failed: {e}");
                return;
            }
        };
        let template = self.learner.learn(&candidates, label, doc, schema, data);
        info!(
            label,
            template_id = %template.id,
            sample_count = template.sample_count,
            "Learned from extraction"
        );
        if let Err(e) = self.templates.upsert(&template).await {
            warn!("Learning write failed: {e}");
        }
    }

    /// Step 7: cache the (successful) result, then stamp the elapsed
    /// time. Error results stay uncached so a retry can succeed.
    async fn store_and_finish(
        &self,
        key: Fingerprint,
        result: ExtractionResult,
        started: Instant,
    ) -> ExtractionResult {
        let result = finish(result, started);
        if result.success {
            self.cache.put(key, &result).await;
        }
        result
    }
}

fn finish(mut result: ExtractionResult, started: Instant) -> ExtractionResult {
    result.metadata.time_seconds = started.elapsed().as_secs_f64();
    result
}

impl std::fmt::Debug for ExtractionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
