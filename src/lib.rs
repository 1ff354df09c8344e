//! # Logrelay
//!
//! A real-time multi-project log collection and query gateway. Records
//! arrive over HTTP POST and long-lived WebSocket sessions, are normalized
//! once, fanned out to live filtered subscribers, and persisted to an
//! external full-text search engine through a batching writer. Search,
//! facet, trace and error-summary queries delegate to the engine and shape
//! its responses.

pub mod config;
pub mod engine;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod subscribers;
pub mod writer;

// Re-export main types for convenience
pub use config::Config;
pub use engine::{DocumentSink, EngineClient, EngineError, SearchRequest, SearchResults};
pub use model::{normalize, Level, LogRecord, RawRecord, RejectReason};
pub use pipeline::{IngestPayload, IngestSummary, Ingestor};
pub use subscribers::{Subscriber, SubscriberFilter, SubscriberRegistry};
pub use writer::{BatchWriter, WriterConfig, WriterMetrics};
