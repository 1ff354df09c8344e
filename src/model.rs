//! # Record Model
//!
//! Core data structures for log records: the canonical `LogRecord` that is
//! stored, broadcast and returned by queries, the inbound `RawRecord` form,
//! and per-record normalization.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity of a log record. Anything outside these five values is rejected
/// at normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Parse a level string, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "fatal" => Some(Level::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized log record.
///
/// The exact same value is pushed to the search engine and delivered to live
/// subscribers; no field diverges between the two copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Unique ULID, monotonic in creation time within a process.
    pub id: String,
    /// RFC 3339 UTC timestamp. Always agrees with `timestamp_ms` to the ms.
    pub timestamp: String,
    /// Unix milliseconds, used for numeric range filters.
    pub timestamp_ms: i64,
    pub project: String,
    pub level: Level,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Arbitrary emitter-supplied metadata, copied verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub environment: String,
}

/// Inbound form of a record, before validation.
///
/// Every field is optional so that a missing value and an invalid value
/// produce distinct rejection reasons.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub timestamp_ms: Option<i64>,
    pub project: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub parent_span_id: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub source: Option<String>,
    pub environment: Option<String>,
}

/// Why a single record was rejected at normalization. A rejected record never
/// fails the batch that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("missing project")]
    MissingProject,
    #[error("missing message")]
    MissingMessage,
    #[error("missing level")]
    MissingLevel,
    #[error("invalid level")]
    InvalidLevel,
}

/// Normalize one inbound record.
///
/// Fills server-assigned fields (id, timestamps, environment), validates the
/// required ones, and reconciles `timestamp` with `timestamp_ms`. The result
/// is idempotent: normalizing an already-normalized record is a no-op.
pub fn normalize(raw: RawRecord) -> Result<LogRecord, RejectReason> {
    let project = match raw.project {
        Some(p) if !p.is_empty() => p,
        _ => return Err(RejectReason::MissingProject),
    };
    let message = match raw.message {
        Some(m) if !m.is_empty() => m,
        _ => return Err(RejectReason::MissingMessage),
    };
    let level = match raw.level.as_deref() {
        None | Some("") => return Err(RejectReason::MissingLevel),
        Some(s) => Level::parse(s).ok_or(RejectReason::InvalidLevel)?,
    };

    // timestamp_ms wins when present; a lone timestamp is parsed and
    // reconciled; a parse failure overwrites both from the wall clock.
    let timestamp_ms = match (raw.timestamp_ms, raw.timestamp.as_deref()) {
        (Some(ms), _) => ms,
        (None, Some(ts)) => ts
            .parse::<DateTime<Utc>>()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|_| Utc::now().timestamp_millis()),
        (None, None) => Utc::now().timestamp_millis(),
    };
    let timestamp = rfc3339_millis(timestamp_ms);

    let id = match raw.id {
        Some(id) if !id.is_empty() => id,
        _ => generate_id(),
    };
    let environment = match raw.environment {
        Some(e) if !e.is_empty() => e,
        _ => "dev".to_string(),
    };

    Ok(LogRecord {
        id,
        timestamp,
        timestamp_ms,
        project,
        level,
        message,
        trace_id: raw.trace_id,
        span_id: raw.span_id,
        parent_span_id: raw.parent_span_id,
        meta: raw.meta,
        source: raw.source,
        environment,
    })
}

/// Render unix milliseconds as a canonical RFC 3339 UTC string.
fn rfc3339_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Generate a creation-time-ordered id, monotonic within this process.
fn generate_id() -> String {
    static GENERATOR: OnceLock<Mutex<ulid::Generator>> = OnceLock::new();
    let mut generator = GENERATOR
        .get_or_init(|| Mutex::new(ulid::Generator::new()))
        .lock();
    generator
        .generate()
        .map(|u| u.to_string())
        .unwrap_or_else(|_| ulid::Ulid::new().to_string())
}
