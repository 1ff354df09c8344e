//! # Ingest Pipeline
//!
//! The single fan-in both transports go through: normalize each inbound
//! record, broadcast it to live subscribers, then hand it to the batch
//! writer's channel. Broadcast strictly precedes persistence, and a rejected
//! record never affects its siblings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{normalize, LogRecord, RawRecord};
use crate::subscribers::SubscriberRegistry;

/// Inbound payload framing: one record or an array of records.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestPayload {
    Single(RawRecord),
    Batch(Vec<RawRecord>),
}

impl IngestPayload {
    pub fn into_records(self) -> Vec<RawRecord> {
        match self {
            IngestPayload::Single(record) => vec![record],
            IngestPayload::Batch(records) => records,
        }
    }
}

/// Per-batch outcome returned to the emitter.
#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IngestError>,
}

/// One rejected record, by position in the submitted batch.
#[derive(Debug, Serialize)]
pub struct IngestError {
    pub index: usize,
    pub reason: String,
}

/// Shared entry point feeding the broadcaster and the batch writer.
#[derive(Clone)]
pub struct Ingestor {
    tx: mpsc::Sender<LogRecord>,
    registry: Arc<SubscriberRegistry>,
}

impl Ingestor {
    pub fn new(tx: mpsc::Sender<LogRecord>, registry: Arc<SubscriberRegistry>) -> Self {
        Self { tx, registry }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Normalize, broadcast and enqueue a batch of raw records. Awaiting the
    /// channel send is the only back-pressure toward emitters; rejected
    /// records are reported per index while their siblings proceed.
    pub async fn ingest(&self, records: Vec<RawRecord>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        for (index, raw) in records.into_iter().enumerate() {
            match normalize(raw) {
                Ok(record) => {
                    self.registry.publish(&record);
                    if let Err(e) = self.tx.send(record).await {
                        // Only happens once the writer is gone at shutdown.
                        tracing::error!(id = %e.0.id, "ingest channel closed, record lost");
                    }
                    summary.accepted += 1;
                }
                Err(reason) => {
                    summary.rejected += 1;
                    summary.errors.push(IngestError {
                        index,
                        reason: reason.to_string(),
                    });
                }
            }
        }
        summary
    }
}
