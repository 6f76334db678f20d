//! Append-only, timestamped event trails.
//!
//! Both nodes and the scheduler keep one. Entries are never edited; the
//! only destructive operation is [`AuditLog::clear`].

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A single audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix epoch milliseconds when the entry was recorded.
    pub at_ms: u64,
    pub message: String,
}

impl LogEntry {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            at_ms: epoch_millis(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.at_ms / 1000;
        let millis = self.at_ms % 1000;
        write!(f, "[{secs}.{millis:03}] {}", self.message)
    }
}

/// Unbounded in-memory audit trail.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message stamped with the current time.
    pub fn record(&mut self, message: impl Into<String>) {
        self.entries.push(LogEntry::now(message));
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
