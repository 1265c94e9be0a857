//! Per-worker log buffers with publish/subscribe notification.
//!
//! Every worker owns a bounded ring buffer of [`LogEntry`] values. Appends
//! evict the oldest entry once the cap is reached and are pushed to every
//! live subscriber of that worker without blocking the producer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A single log line recorded for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,

    /// Severity.
    pub level: LogLevel,

    /// Message text.
    pub message: String,
}

/// Log severity visible to log viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// An entry was appended.
    Appended(LogEntry),
    /// The worker's buffer was cleared.
    Cleared,
}

/// Receiving side handed to [`LogChannel::subscribe`].
pub type LogSink = mpsc::UnboundedSender<LogEvent>;

/// Identifier returned by [`LogChannel::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    sink: LogSink,
}

struct ChannelInner {
    capacity: usize,
    buffers: DashMap<String, Mutex<VecDeque<LogEntry>>>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_subscription: AtomicU64,
}

/// Shared, cheaply clonable handle to the per-worker log buffers.
#[derive(Clone)]
pub struct LogChannel {
    inner: Arc<ChannelInner>,
}

impl LogChannel {
    /// Create a channel keeping at most `capacity` entries per worker.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                capacity: capacity.max(1),
                buffers: DashMap::new(),
                subscribers: DashMap::new(),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Maximum entries kept per worker.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Append an entry for `worker_id` and notify its subscribers.
    pub fn append(&self, worker_id: &str, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };

        match level {
            LogLevel::Info => info!(worker_id, guest_log = true, "{}", entry.message),
            LogLevel::Warn => warn!(worker_id, guest_log = true, "{}", entry.message),
            LogLevel::Error => error!(worker_id, guest_log = true, "{}", entry.message),
        }

        {
            let buffer = self
                .inner
                .buffers
                .entry(worker_id.to_string())
                .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.inner.capacity)));
            let mut buffer = buffer.lock();
            if buffer.len() == self.inner.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        self.publish(worker_id, &LogEvent::Appended(entry.clone()));
        entry
    }

    /// Append an `info` entry.
    pub fn info(&self, worker_id: &str, message: impl Into<String>) -> LogEntry {
        self.append(worker_id, LogLevel::Info, message)
    }

    /// Append a `warn` entry.
    pub fn warn(&self, worker_id: &str, message: impl Into<String>) -> LogEntry {
        self.append(worker_id, LogLevel::Warn, message)
    }

    /// Append an `error` entry.
    pub fn error(&self, worker_id: &str, message: impl Into<String>) -> LogEntry {
        self.append(worker_id, LogLevel::Error, message)
    }

    /// Snapshot of the entries for `worker_id`, oldest first.
    pub fn get_logs(&self, worker_id: &str) -> Vec<LogEntry> {
        self.inner
            .buffers
            .get(worker_id)
            .map(|buffer| buffer.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every entry for `worker_id` and tell subscribers.
    pub fn clear_logs(&self, worker_id: &str) {
        if let Some(buffer) = self.inner.buffers.get(worker_id) {
            buffer.lock().clear();
        }
        self.publish(worker_id, &LogEvent::Cleared);
    }

    /// Drop the buffer and all subscribers of a deleted worker.
    pub fn delete_logs(&self, worker_id: &str) {
        self.inner.buffers.remove(worker_id);
        self.inner.subscribers.remove(worker_id);
    }

    /// Register `sink` for events of `worker_id`.
    pub fn subscribe(&self, worker_id: &str, sink: LogSink) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscribers
            .entry(worker_id.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, worker_id: &str, id: SubscriptionId) -> bool {
        let Some(mut subscribers) = self.inner.subscribers.get_mut(worker_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Number of live subscriptions for `worker_id`.
    pub fn subscriber_count(&self, worker_id: &str) -> usize {
        self.inner
            .subscribers
            .get(worker_id)
            .map_or(0, |subscribers| subscribers.len())
    }

    fn publish(&self, worker_id: &str, event: &LogEvent) {
        let mut closed = Vec::new();
        if let Some(subscribers) = self.inner.subscribers.get(worker_id) {
            for subscriber in subscribers.iter() {
                if subscriber.sink.send(event.clone()).is_err() {
                    closed.push(subscriber.id);
                }
            }
        }
        if closed.is_empty() {
            return;
        }
        if let Some(mut subscribers) = self.inner.subscribers.get_mut(worker_id) {
            subscribers.retain(|s| !closed.contains(&s.id));
        }
    }
}

impl std::fmt::Debug for LogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogChannel")
            .field("capacity", &self.inner.capacity)
            .field("workers", &self.inner.buffers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_get() {
        let logs = LogChannel::new(10);

        logs.info("w1", "hello");
        logs.error("w1", "boom");
        logs.warn("w2", "other worker");

        let entries = logs.get_logs("w1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "hello");
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(logs.get_logs("w2").len(), 1);
        assert!(logs.get_logs("missing").is_empty());
    }

    #[test]
    fn test_overflow_evicts_exactly_the_oldest() {
        let cap = 5;
        let logs = LogChannel::new(cap);

        for i in 0..=cap {
            logs.info("w", format!("entry {i}"));
        }

        let messages: Vec<String> = logs.get_logs("w").into_iter().map(|e| e.message).collect();
        assert_eq!(messages.len(), cap);
        assert_eq!(
            messages,
            vec!["entry 1", "entry 2", "entry 3", "entry 4", "entry 5"]
        );
    }

    #[test]
    fn test_clear_logs_notifies() {
        let logs = LogChannel::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        logs.subscribe("w", tx);

        logs.info("w", "one");
        logs.clear_logs("w");

        assert!(logs.get_logs("w").is_empty());
        assert!(matches!(rx.try_recv(), Ok(LogEvent::Appended(e)) if e.message == "one"));
        assert_eq!(rx.try_recv(), Ok(LogEvent::Cleared));
    }

    #[test]
    fn test_subscribe_only_sees_own_worker() {
        let logs = LogChannel::new(10);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = logs.subscribe("a", tx);

        logs.info("b", "not for a");
        logs.info("a", "for a");

        assert!(matches!(rx.try_recv(), Ok(LogEvent::Appended(e)) if e.message == "for a"));
        assert!(rx.try_recv().is_err());

        assert!(logs.unsubscribe("a", id));
        assert!(!logs.unsubscribe("a", id));
        logs.info("a", "after unsubscribe");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_sinks_are_pruned() {
        let logs = LogChannel::new(10);
        let (tx, rx) = mpsc::unbounded_channel();
        logs.subscribe("w", tx);
        assert_eq!(logs.subscriber_count("w"), 1);

        drop(rx);
        logs.info("w", "nobody listening");

        assert_eq!(logs.subscriber_count("w"), 0);
    }

    #[test]
    fn test_delete_logs() {
        let logs = LogChannel::new(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        logs.subscribe("w", tx);
        logs.info("w", "x");

        logs.delete_logs("w");

        assert!(logs.get_logs("w").is_empty());
        assert_eq!(logs.subscriber_count("w"), 0);
    }

    #[test]
    fn test_concurrent_writers() {
        let logs = LogChannel::new(10_000);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let logs = logs.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        logs.info("shared", format!("{t}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(logs.get_logs("shared").len(), 800);
    }

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Info.to_string(), "info");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::Error.to_string(), "error");
    }
}
