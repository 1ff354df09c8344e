//! # Batch Writer
//!
//! A single task that drains the ingest channel into size/time bounded
//! batches and pushes them to the search engine. At most one flush is in
//! flight at a time; failed flushes retry with jittered exponential backoff
//! and are dropped with a diagnostic once the attempt budget is spent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{
    BATCH_MAX_AGE, BATCH_MAX_RECORDS, FLUSH_BACKOFF_BASE, FLUSH_BACKOFF_CAP, FLUSH_MAX_ATTEMPTS,
    SHUTDOWN_DRAIN_DEADLINE,
};
use crate::engine::DocumentSink;
use crate::model::LogRecord;

/// Tuning for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush once this many records are pending.
    pub max_records: usize,
    /// Flush once the oldest pending record is this old.
    pub max_age: Duration,
    /// Delivery attempts per batch, including the first.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Bound on draining at graceful shutdown.
    pub drain_deadline: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_records: BATCH_MAX_RECORDS,
            max_age: BATCH_MAX_AGE,
            max_attempts: FLUSH_MAX_ATTEMPTS,
            backoff_base: FLUSH_BACKOFF_BASE,
            backoff_cap: FLUSH_BACKOFF_CAP,
            drain_deadline: SHUTDOWN_DRAIN_DEADLINE,
        }
    }
}

/// Lock-free counters exposed by the writer.
#[derive(Debug, Default)]
pub struct WriterMetrics {
    pub batches_flushed: AtomicU64,
    pub records_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub records_dropped: AtomicU64,
}

/// Owns the drain side of the ingest channel.
pub struct BatchWriter<S: DocumentSink> {
    sink: Arc<S>,
    rx: mpsc::Receiver<LogRecord>,
    config: WriterConfig,
    metrics: Arc<WriterMetrics>,
}

impl<S: DocumentSink> BatchWriter<S> {
    pub fn new(sink: S, rx: mpsc::Receiver<LogRecord>) -> Self {
        Self::with_config(sink, rx, WriterConfig::default())
    }

    pub fn with_config(sink: S, rx: mpsc::Receiver<LogRecord>, config: WriterConfig) -> Self {
        Self {
            sink: Arc::new(sink),
            rx,
            config,
            metrics: Arc::new(WriterMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<WriterMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run until the ingest channel closes, then drain under the shutdown
    /// deadline. Call this in a spawned task.
    pub async fn run(self) {
        let BatchWriter {
            sink,
            mut rx,
            config,
            metrics,
        } = self;
        let mut pending: Vec<LogRecord> = Vec::with_capacity(config.max_records);
        // Set when the first record of a batch arrives; cleared on flush.
        let mut deadline: Option<Instant> = None;
        let mut inflight: Option<JoinHandle<()>> = None;

        loop {
            // Snapshot the flush state so the arm guards hold no borrows.
            let idle = inflight.is_none();
            let flush_at = deadline;
            let flush_due = async move {
                match flush_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                received = rx.recv() => match received {
                    Some(record) => {
                        if pending.is_empty() {
                            deadline = Some(Instant::now() + config.max_age);
                        }
                        pending.push(record);
                        if pending.len() >= config.max_records && inflight.is_none() {
                            inflight =
                                Some(begin_flush(&sink, &mut pending, &mut deadline, &config, &metrics));
                        }
                    }
                    None => break,
                },
                _ = flush_due, if idle => {
                    if pending.is_empty() {
                        deadline = None;
                    } else {
                        inflight =
                            Some(begin_flush(&sink, &mut pending, &mut deadline, &config, &metrics));
                    }
                }
                _ = async { let _ = inflight.as_mut().expect("in-flight flush").await; },
                    if !idle =>
                {
                    inflight = None;
                    let overdue = deadline.is_some_and(|at| at <= Instant::now());
                    if pending.len() >= config.max_records || (overdue && !pending.is_empty()) {
                        inflight =
                            Some(begin_flush(&sink, &mut pending, &mut deadline, &config, &metrics));
                    }
                }
            }
        }

        // Channel closed: every producer is gone and the buffered records
        // have all been received. Finish the in-flight flush and push the
        // remainder, bounded by the drain deadline.
        let leftover = pending.len();
        let drain = async {
            if let Some(handle) = inflight {
                let _ = handle.await;
            }
            if !pending.is_empty() {
                let batch = std::mem::take(&mut pending);
                flush_batch(&*sink, batch, &config, &metrics).await;
            }
        };
        if tokio::time::timeout(config.drain_deadline, drain).await.is_err() {
            tracing::error!(leftover, "shutdown drain deadline exceeded, records lost");
        }
        tracing::info!(
            batches = metrics.batches_flushed.load(Ordering::Relaxed),
            records = metrics.records_flushed.load(Ordering::Relaxed),
            dropped = metrics.records_dropped.load(Ordering::Relaxed),
            "batch writer stopped"
        );
    }
}

/// Hand the pending batch to a spawned flush and reset the deadline.
fn begin_flush<S: DocumentSink>(
    sink: &Arc<S>,
    pending: &mut Vec<LogRecord>,
    deadline: &mut Option<Instant>,
    config: &WriterConfig,
    metrics: &Arc<WriterMetrics>,
) -> JoinHandle<()> {
    let batch = std::mem::take(pending);
    *deadline = None;
    let sink = Arc::clone(sink);
    let config = config.clone();
    let metrics = Arc::clone(metrics);
    tokio::spawn(async move { flush_batch(&*sink, batch, &config, &metrics).await })
}

/// Deliver one batch, retrying transient failures. Records preserve arrival
/// order within the batch.
async fn flush_batch<S: DocumentSink + ?Sized>(
    sink: &S,
    batch: Vec<LogRecord>,
    config: &WriterConfig,
    metrics: &WriterMetrics,
) {
    let count = batch.len();
    let mut attempt = 1u32;
    loop {
        match sink.upsert_documents(&batch).await {
            Ok(()) => {
                metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
                metrics.records_flushed.fetch_add(count as u64, Ordering::Relaxed);
                tracing::debug!(records = count, "flushed batch");
                return;
            }
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    records = count,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "flush failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
                metrics.records_dropped.fetch_add(count as u64, Ordering::Relaxed);
                tracing::error!(records = count, attempts = attempt, error = %e, "dropping batch");
                return;
            }
        }
    }
}

/// Exponential backoff with multiplicative jitter, capped.
fn backoff_delay(config: &WriterConfig, attempt: u32) -> Duration {
    let exp = config.backoff_base.saturating_mul(1 << attempt.min(6));
    let capped = exp.min(config.backoff_cap);
    capped
        .mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        .min(config.backoff_cap)
}
