use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Lifetime connection statistics for one session.
///
/// Counters only grow; a fresh [`crate::SessionContext`] starts them over.
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    total_attempts: AtomicU64,
    successful_connections: AtomicU64,
    // Running sum backing the cumulative average; never windowed.
    connect_time_total_micros: AtomicU64,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
}

impl StatsTracker {
    pub(crate) fn record_attempt(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, connect_time: Duration) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
        self.connect_time_total_micros
            .fetch_add(connect_time.as_micros() as u64, Ordering::Relaxed);
        *self.last_connected_at.write() = Some(Utc::now());
    }

    /// Get a point-in-time snapshot of the statistics
    pub(crate) fn snapshot(&self) -> ConnectionStats {
        let successes = self.successful_connections.load(Ordering::Acquire);
        let total_micros = self.connect_time_total_micros.load(Ordering::Acquire);

        let average_connect_time = if successes > 0 {
            Some(Duration::from_micros(total_micros / successes))
        } else {
            None
        };

        ConnectionStats {
            total_attempts: self.total_attempts.load(Ordering::Acquire),
            successful_connections: successes,
            last_connected_at: *self.last_connected_at.read(),
            average_connect_time,
        }
    }
}

/// Point-in-time snapshot of connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    /// Connection attempts made, failed ones included
    pub total_attempts: u64,
    /// Attempts that completed the handshake
    pub successful_connections: u64,
    /// When the link last came up
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Cumulative average time to establish a connection
    pub average_connect_time: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_attempts_and_successes() {
        let tracker = StatsTracker::default();

        tracker.record_attempt();
        tracker.record_attempt();
        tracker.record_success(Duration::from_millis(20));

        let stats = tracker.snapshot();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_connections, 1);
        assert!(stats.last_connected_at.is_some());
    }

    #[test]
    fn test_average_connect_time_is_cumulative() {
        let tracker = StatsTracker::default();

        tracker.record_attempt();
        tracker.record_success(Duration::from_millis(10));
        tracker.record_attempt();
        tracker.record_success(Duration::from_millis(30));

        let stats = tracker.snapshot();
        assert_eq!(
            stats.average_connect_time,
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn test_no_average_without_successes() {
        let tracker = StatsTracker::default();
        tracker.record_attempt();

        let stats = tracker.snapshot();
        assert_eq!(stats.average_connect_time, None);
        assert!(stats.last_connected_at.is_none());
    }
}
