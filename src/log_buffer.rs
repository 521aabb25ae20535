use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Default maximum number of entries kept
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Only events from this crate end up in the engine log
const CRATE_TARGET: &str = "reauth_proxy";

/// Engine log levels, most verbose first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    /// Map a tracing level; trace folds into debug, warn into info
    pub fn from_tracing(level: &Level) -> Self {
        if *level == Level::ERROR {
            LogLevel::Error
        } else if *level <= Level::INFO && *level >= Level::WARN {
            LogLevel::Info
        } else {
            LogLevel::Debug
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

struct Inner {
    min_level: LogLevel,
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

/// Bounded in-memory log shown by the UI
///
/// Cheap to clone; all clones share the same entries.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LogLevel::Info, DEFAULT_MAX_ENTRIES)
    }
}

impl LogBuffer {
    pub fn new(min_level: LogLevel, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                min_level,
                capacity,
                entries: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn min_level(&self) -> LogLevel {
        self.lock().min_level
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.lock().min_level = level;
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Change the maximum length; excess oldest entries are dropped now
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.lock();
        inner.capacity = capacity;
        while inner.entries.len() > capacity {
            inner.entries.pop_front();
        }
    }

    /// Append an entry if it passes the level filter
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        self.push_entry(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    fn push_entry(&self, entry: LogEntry) {
        let mut inner = self.lock();
        insert(&mut inner, entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Tracing layer feeding this buffer
    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
            target: CRATE_TARGET,
        }
    }
}

fn insert(inner: &mut Inner, entry: LogEntry) {
    if entry.level < inner.min_level || inner.capacity == 0 {
        return;
    }
    while inner.entries.len() >= inner.capacity {
        inner.entries.pop_front();
    }
    inner.entries.push_back(entry);
}

/// Tracing layer that captures this crate's events into a [`LogBuffer`]
pub struct LogBufferLayer {
    buffer: LogBuffer,
    target: &'static str,
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(self.target) {
            return;
        }

        let level = LogLevel::from_tracing(metadata.level());

        let mut message = String::new();
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };

        // skip rather than block the logging thread
        if let Ok(mut inner) = self.buffer.inner.try_lock() {
            insert(&mut inner, entry);
        }
    }
}

/// Visitor to extract message field from tracing events
struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let rendered = format!("{:?}", value);
            if self.0.is_empty() {
                *self.0 = rendered;
            } else {
                *self.0 = format!("{} {}", rendered, self.0);
            }
        } else {
            if !self.0.is_empty() {
                self.0.push(' ');
            }
            self.0.push_str(&format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            if self.0.is_empty() {
                *self.0 = value.to_string();
            } else {
                *self.0 = format!("{} {}", value, self.0);
            }
        } else {
            if !self.0.is_empty() {
                self.0.push(' ');
            }
            self.0.push_str(&format!("{}={}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    fn capture(buffer: &LogBuffer, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(buffer.layer());
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn test_layer_captures_info() {
        let buffer = LogBuffer::default();
        capture(&buffer, || {
            tracing::info!("Parsed token from response");
        });

        let logs = buffer.entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Info);
        assert_eq!(logs[0].message, "Parsed token from response");
    }

    #[test]
    fn test_layer_filters_below_min_level() {
        let buffer = LogBuffer::default();
        capture(&buffer, || {
            tracing::debug!("Debug message should be filtered");
        });
        assert!(buffer.is_empty());

        buffer.set_min_level(LogLevel::Debug);
        capture(&buffer, || {
            tracing::debug!("now kept");
        });
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_layer_ignores_foreign_targets() {
        let buffer = LogBuffer::default();
        capture(&buffer, || {
            tracing::info!(target: "hyper::proto", "connection closed");
        });
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fields_are_appended() {
        let buffer = LogBuffer::default();
        capture(&buffer, || {
            tracing::error!(stamp = 3u64, "Caught error while refreshing token");
        });

        let logs = buffer.entries();
        assert_eq!(logs[0].level, LogLevel::Error);
        assert_eq!(logs[0].message, "Caught error while refreshing token stamp=3");
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let buffer = LogBuffer::new(LogLevel::Info, 5);
        for i in 0..10 {
            buffer.push(LogLevel::Info, format!("Message {}", i));
        }

        let logs = buffer.entries();
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[0].message, "Message 5");
    }

    #[test]
    fn test_lowering_capacity_culls_immediately() {
        let buffer = LogBuffer::default();
        for i in 0..10 {
            buffer.push(LogLevel::Error, format!("Message {}", i));
        }

        buffer.set_capacity(3);
        let logs = buffer.entries();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[2].message, "Message 9");

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::from_tracing(&Level::TRACE), LogLevel::Debug);
        assert_eq!(LogLevel::from_tracing(&Level::DEBUG), LogLevel::Debug);
        assert_eq!(LogLevel::from_tracing(&Level::INFO), LogLevel::Info);
        assert_eq!(LogLevel::from_tracing(&Level::WARN), LogLevel::Info);
        assert_eq!(LogLevel::from_tracing(&Level::ERROR), LogLevel::Error);
        assert_eq!("ERROR".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert!("verbose".parse::<LogLevel>().is_err());
    }
}
