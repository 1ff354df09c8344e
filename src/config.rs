//! # Configuration
//!
//! Runtime configuration and documented defaults. All tunable constants are
//! centralized here.

use std::time::Duration;

/// Runtime configuration, assembled by the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WS listen port.
    pub port: u16,
    /// Search engine base URL.
    pub meili_host: String,
    /// Search engine API key; empty means no credential is attached.
    pub meili_key: String,
}

impl Config {
    pub fn new(port: u16, meili_host: impl Into<String>, meili_key: impl Into<String>) -> Self {
        Self {
            port,
            meili_host: meili_host.into(),
            meili_key: meili_key.into(),
        }
    }
}

// =============================================================================
// Network Defaults
// =============================================================================

/// Default listen port.
pub const DEFAULT_PORT: u16 = 4800;

/// Default search engine host.
pub const DEFAULT_MEILI_HOST: &str = "http://localhost:7700";

// =============================================================================
// Index Defaults
// =============================================================================

/// Name of the engine index all records land in.
pub const INDEX_NAME: &str = "logs";

/// Upper bound on exhaustive pagination at the engine.
pub const INDEX_MAX_TOTAL_HITS: usize = 10_000;

// =============================================================================
// Ingest Defaults
// =============================================================================

/// Capacity of the ingest channel between producers and the batch writer.
/// Producers await when the channel is full; this is the only back-pressure
/// toward emitters.
pub const INGEST_CHANNEL_CAPACITY: usize = 4096;

/// Maximum records per flush to the engine.
pub const BATCH_MAX_RECORDS: usize = 200;

/// Maximum age of the oldest pending record before a flush is forced.
pub const BATCH_MAX_AGE: Duration = Duration::from_millis(250);

// =============================================================================
// Engine Call Defaults
// =============================================================================

/// Per-attempt timeout on engine HTTP calls.
pub const ENGINE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum delivery attempts per batch, including the first.
pub const FLUSH_MAX_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff between flush attempts.
pub const FLUSH_BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Ceiling on the backoff delay, jitter included.
pub const FLUSH_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Hard bound on draining the channel at graceful shutdown.
pub const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

// =============================================================================
// Subscriber Defaults
// =============================================================================

/// Pending records buffered per subscriber before drop-oldest kicks in.
pub const SUBSCRIBER_BUFFER_CAPACITY: usize = 256;

/// Total drops after which a subscriber is considered irrecoverably slow and
/// force-closed.
pub const SUBSCRIBER_DROP_LIMIT: u64 = 1024;
