//! Batch scheduling: serial within a label, parallel across labels.
//!
//! Requests are grouped by label in input order. One worker per label
//! walks its group sequentially, so template learning from item *k* is
//! visible to item *k+1*; workers across labels run concurrently under a
//! semaphore. Every finished item is streamed immediately as a `Result`
//! event carrying its original input index, and a final `Complete` event
//! reports aggregate statistics.

use crate::pipeline::{CancelHandle, CancelToken, ExtractionPipeline};
use crate::types::{ExtractionRequest, ExtractionResult};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// One event of the batch stream.
#[derive(Debug)]
pub enum BatchEvent {
    /// An item finished; `file_index` is its position in the input.
    Result {
        file_index: usize,
        label: String,
        result: ExtractionResult,
    },
    /// The batch is done. Always the last event, even after cancellation.
    Complete(BatchStats),
}

/// Aggregate statistics reported by the terminating event.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub processing_time_seconds: f64,
    /// Per-method result counts, keyed by the method tag.
    pub methods: BTreeMap<String, usize>,
    pub labels: BTreeSet<String>,
}

pub struct BatchScheduler {
    pipeline: Arc<ExtractionPipeline>,
    max_workers: usize,
}

impl BatchScheduler {
    pub fn new(pipeline: Arc<ExtractionPipeline>) -> Self {
        let max_workers = pipeline.config().batch.max_workers.max(1);
        Self {
            pipeline,
            max_workers,
        }
    }

    /// Runs the batch in the background, returning a cancel handle and
    /// the event stream. Cancellation stops new items from starting;
    /// items already in flight run to completion and `Complete` still
    /// fires with the partial counts.
    pub fn run(
        &self,
        requests: Vec<ExtractionRequest>,
    ) -> (CancelHandle, ReceiverStream<BatchEvent>) {
        let (handle, token) = CancelToken::pair();
        let (tx, rx) = mpsc::channel(64);

        let total = requests.len();
        let mut groups: BTreeMap<String, Vec<(usize, ExtractionRequest)>> = BTreeMap::new();
        for (index, request) in requests.into_iter().enumerate() {
            groups
                .entry(request.label.clone())
                .or_default()
                .push((index, request));
        }

        info!(
            total,
            labels = groups.len(),
            max_workers = self.max_workers,
            "Starting batch"
        );

        let label_set: BTreeSet<String> = groups.keys().cloned().collect();
        let pipeline = self.pipeline.clone();
        let max_workers = self.max_workers;
        tokio::spawn(async move {
            let started = Instant::now();
            let semaphore = Arc::new(Semaphore::new(max_workers));

            let workers: Vec<_> = groups
                .into_iter()
                .map(|(label, items)| {
                    let pipeline = pipeline.clone();
                    let semaphore = semaphore.clone();
                    let token = token.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return Vec::new(),
                        };
                        let mut outcomes = Vec::new();
                        for (file_index, request) in items {
                            if token.is_cancelled() {
                                info!(%label, "Cancelled; not starting remaining items");
                                break;
                            }
                            let result = pipeline.extract(request).await;
                            outcomes.push((result.metadata.method, result.success));
                            let event = BatchEvent::Result {
                                file_index,
                                label: label.clone(),
                                result,
                            };
                            if tx.send(event).await.is_err() {
                                // Receiver gone; keep processing so the
                                // label's learning order stays intact.
                                warn!(%label, "Batch event receiver dropped");
                            }
                        }
                        outcomes
                    })
                })
                .collect();

            let mut methods: BTreeMap<String, usize> = BTreeMap::new();
            let mut successful = 0usize;
            let mut failed = 0usize;

            for (worker, outcomes) in join_all(workers).await.into_iter().enumerate() {
                match outcomes {
                    Ok(outcomes) => {
                        for (method, success) in outcomes {
                            *methods.entry(method.as_str().to_string()).or_insert(0) += 1;
                            if success {
                                successful += 1;
                            } else {
                                failed += 1;
                            }
                        }
                    }
                    Err(e) => warn!("Batch worker {worker} panicked: {e}"),
                }
            }

            let stats = BatchStats {
                total,
                successful,
                failed,
                processing_time_seconds: started.elapsed().as_secs_f64(),
                methods,
                labels: label_set,
            };
            let _ = tx.send(BatchEvent::Complete(stats)).await;
        });

        (handle, ReceiverStream::new(rx))
    }
}
