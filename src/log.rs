use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::ErrorCategory;

/// Oldest entries are evicted beyond this count.
const MAX_ENTRIES: usize = 100;

/// Which side of the client produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// The realtime WebSocket link
    Socket,
    /// The HTTP API service
    Api,
}

/// Request/connection detail captured alongside an error
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogContext {
    /// Endpoint involved, credentials already scrubbed
    pub url: Option<String>,
    /// Attempt the error occurred on, counting from 1. 0 means the failure
    /// happened outside an attempt: pre-flight validation, or an
    /// established link dropping.
    pub attempt: u32,
}

/// One recorded error occurrence
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogEntry {
    /// Monotonic id, unique within the session
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub source: ErrorSource,
    pub category: ErrorCategory,
    pub message: String,
    pub context: LogContext,
    /// Set once the source recovers after this entry
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Capped in-memory error log.
///
/// Holds the last [`MAX_ENTRIES`] errors. When a source recovers (the link
/// comes back, a request succeeds), its unresolved entries are marked
/// resolved rather than removed, so the history stays inspectable.
#[derive(Debug, Default)]
pub(crate) struct ErrorLog {
    next_id: AtomicU64,
    entries: RwLock<VecDeque<ErrorLogEntry>>,
}

impl ErrorLog {
    /// Append an entry, evicting the oldest once the cap is reached.
    /// Returns the id of the new entry.
    pub(crate) fn record(
        &self,
        source: ErrorSource,
        category: ErrorCategory,
        message: impl Into<String>,
        context: LogContext,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = ErrorLogEntry {
            id,
            timestamp: Utc::now(),
            source,
            category,
            message: message.into(),
            context,
            resolved: false,
            resolved_at: None,
        };

        let mut entries = self.entries.write();
        if entries.len() == MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Mark every unresolved entry from `source` as resolved.
    /// Returns how many entries changed.
    pub(crate) fn mark_resolved(&self, source: ErrorSource) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let mut marked = 0;

        for entry in entries.iter_mut() {
            if entry.source == source && !entry.resolved {
                entry.resolved = true;
                entry.resolved_at = Some(now);
                marked += 1;
            }
        }

        marked
    }

    /// Snapshot of all retained entries, oldest first
    pub(crate) fn entries(&self) -> Vec<ErrorLogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().len()
    }
}
