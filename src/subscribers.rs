//! # Subscriber Registry
//!
//! Live WebSocket subscribers and the fan-out path. Each subscriber owns a
//! bounded delivery buffer; publishing never blocks and never touches the
//! persistence path. A subscriber that keeps overflowing its buffer is
//! declared irrecoverably slow and force-closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;

use crate::config::{SUBSCRIBER_BUFFER_CAPACITY, SUBSCRIBER_DROP_LIMIT};
use crate::model::LogRecord;

/// Conjunction of optional constraints evaluated against every record.
/// An empty component matches everything; a record missing a field does not
/// match a filter that requires it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriberFilter {
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub levels: Vec<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

impl SubscriberFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        if !self.projects.is_empty() && !self.projects.iter().any(|p| *p == record.project) {
            return false;
        }
        if !self.levels.is_empty() && !self.levels.iter().any(|l| l == record.level.as_str()) {
            return false;
        }
        if let Some(trace_id) = &self.trace_id {
            if record.trace_id.as_deref() != Some(trace_id.as_str()) {
                return false;
            }
        }
        if let Some(environment) = &self.environment {
            if record.environment != *environment {
                return false;
            }
        }
        true
    }
}

/// One live subscriber. The socket task holds only the handle id and an Arc
/// to this state; the registry owns the table.
pub struct Subscriber {
    id: u64,
    filter: SubscriberFilter,
    buffer: Mutex<VecDeque<Arc<str>>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Subscriber {
    fn new(id: u64, filter: SubscriberFilter) -> Self {
        Self {
            id,
            filter,
            buffer: Mutex::new(VecDeque::with_capacity(16)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &SubscriberFilter {
        &self.filter
    }

    /// Records dropped on this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking enqueue. On overflow the oldest pending record is
    /// dropped and counted; past the drop limit the subscriber is closed.
    fn enqueue(&self, payload: Arc<str>, capacity: usize, drop_limit: u64) {
        if self.is_closed() {
            return;
        }
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= capacity {
                buffer.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped > drop_limit {
                    drop(buffer);
                    tracing::warn!(subscriber = self.id, dropped, "subscriber too slow, closing");
                    self.close();
                    return;
                }
            }
            buffer.push_back(payload);
        }
        self.notify.notify_one();
    }

    /// Await the next pending payload. Returns `None` once the subscriber is
    /// closed.
    pub async fn next(&self) -> Option<Arc<str>> {
        loop {
            if self.is_closed() {
                return None;
            }
            if let Some(payload) = self.buffer.lock().pop_front() {
                return Some(payload);
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Process-wide table of live subscribers, keyed by handle id. Publish walks
/// the sharded map without any global lock.
pub struct SubscriberRegistry {
    subscribers: DashMap<u64, Arc<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    drop_limit: u64,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_limits(SUBSCRIBER_BUFFER_CAPACITY, SUBSCRIBER_DROP_LIMIT)
    }

    pub fn with_limits(capacity: usize, drop_limit: u64) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity,
            drop_limit,
        })
    }

    /// Register a new subscriber with the given filter.
    pub fn register(&self, filter: SubscriberFilter) -> Arc<Subscriber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber::new(id, filter));
        self.subscribers.insert(id, Arc::clone(&subscriber));
        subscriber
    }

    /// Remove a subscriber and close its buffer. Safe to call twice.
    pub fn deregister(&self, id: u64) {
        if let Some((_, subscriber)) = self.subscribers.remove(&id) {
            subscriber.close();
        }
    }

    /// Fan one record out to every matching subscriber. Serializes the
    /// record once; never blocks.
    pub fn publish(&self, record: &LogRecord) {
        if self.subscribers.is_empty() {
            return;
        }
        let payload: Arc<str> = match serde_json::to_string(record) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(error = %e, "record failed to serialize for broadcast");
                return;
            }
        };

        let mut expired: Vec<u64> = Vec::new();
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if subscriber.filter.matches(record) {
                subscriber.enqueue(Arc::clone(&payload), self.capacity, self.drop_limit);
                if subscriber.is_closed() {
                    expired.push(subscriber.id);
                }
            }
        }
        for id in expired {
            self.subscribers.remove(&id);
        }
    }

    /// Close every subscriber. Used at graceful shutdown.
    pub fn close_all(&self) {
        for entry in self.subscribers.iter() {
            entry.value().close();
        }
        self.subscribers.clear();
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{normalize, RawRecord};

    fn record(project: &str, level: &str, message: &str) -> LogRecord {
        normalize(RawRecord {
            project: Some(project.to_string()),
            level: Some(level.to_string()),
            message: Some(message.to_string()),
            ..RawRecord::default()
        })
        .unwrap()
    }

    fn traced(project: &str, trace_id: &str) -> LogRecord {
        let mut r = record(project, "info", "m");
        r.trace_id = Some(trace_id.to_string());
        r
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SubscriberFilter::default();
        assert!(filter.matches(&record("api", "debug", "m")));
        assert!(filter.matches(&traced("web", "t-9")));
    }

    #[test]
    fn filter_components_are_conjunctive() {
        let filter = SubscriberFilter {
            projects: vec!["api".to_string()],
            levels: vec!["error".to_string()],
            ..SubscriberFilter::default()
        };
        assert!(filter.matches(&record("api", "error", "m")));
        assert!(!filter.matches(&record("api", "info", "m")));
        assert!(!filter.matches(&record("web", "error", "m")));
    }

    #[test]
    fn missing_record_field_does_not_match() {
        let filter = SubscriberFilter {
            trace_id: Some("t-1".to_string()),
            ..SubscriberFilter::default()
        };
        assert!(!filter.matches(&record("api", "info", "m")));
        assert!(filter.matches(&traced("api", "t-1")));
        assert!(!filter.matches(&traced("api", "t-2")));
    }

    #[test]
    fn extending_a_filter_only_shrinks_the_match_set() {
        let records = [
            record("api", "error", "a"),
            record("api", "info", "b"),
            record("web", "error", "c"),
            traced("api", "t-1"),
        ];
        let loose = SubscriberFilter {
            projects: vec!["api".to_string()],
            ..SubscriberFilter::default()
        };
        let tight = SubscriberFilter {
            projects: vec!["api".to_string()],
            levels: vec!["error".to_string()],
            ..SubscriberFilter::default()
        };
        for r in &records {
            if tight.matches(r) {
                assert!(loose.matches(r));
            }
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_matching_subscribers_only() {
        let registry = SubscriberRegistry::with_limits(8, 16);
        let api_errors = registry.register(SubscriberFilter {
            projects: vec!["api".to_string()],
            levels: vec!["error".to_string()],
            ..SubscriberFilter::default()
        });
        let everything = registry.register(SubscriberFilter::default());

        registry.publish(&record("api", "error", "x"));
        registry.publish(&record("api", "info", "y"));
        registry.publish(&record("web", "error", "z"));

        let frame = api_errors.next().await.unwrap();
        assert!(frame.contains("\"message\":\"x\""));
        for expected in ["x", "y", "z"] {
            let frame = everything.next().await.unwrap();
            assert!(frame.contains(&format!("\"message\":\"{expected}\"")));
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let registry = SubscriberRegistry::with_limits(2, 100);
        let subscriber = registry.register(SubscriberFilter::default());

        registry.publish(&record("api", "info", "a"));
        registry.publish(&record("api", "info", "b"));
        registry.publish(&record("api", "info", "c"));

        assert_eq!(subscriber.dropped(), 1);
        let buffer = subscriber.buffer.lock();
        assert_eq!(buffer.len(), 2);
        assert!(buffer[0].contains("\"message\":\"b\""));
        assert!(buffer[1].contains("\"message\":\"c\""));
    }

    #[test]
    fn chronic_overflow_force_closes_subscriber() {
        let registry = SubscriberRegistry::with_limits(2, 4);
        let subscriber = registry.register(SubscriberFilter::default());

        for i in 0..16 {
            registry.publish(&record("api", "info", &format!("m{i}")));
        }

        assert!(subscriber.is_closed());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn closed_subscriber_yields_none() {
        let registry = SubscriberRegistry::with_limits(8, 16);
        let subscriber = registry.register(SubscriberFilter::default());
        registry.deregister(subscriber.id());
        assert!(subscriber.next().await.is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn deregistered_subscriber_no_longer_receives() {
        let registry = SubscriberRegistry::with_limits(8, 16);
        let subscriber = registry.register(SubscriberFilter::default());
        registry.deregister(subscriber.id());
        registry.publish(&record("api", "info", "late"));
        assert!(subscriber.buffer.lock().is_empty());
    }
}
