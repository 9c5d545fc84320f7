use std::time::Instant;

use tokio::time::Duration;

use crate::config::HeartbeatConfig;

/// Tracks ping/pong liveness for a single connection
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    config: HeartbeatConfig,

    /// Time of last ping sent
    last_ping_sent: Option<Instant>,

    /// Time of last pong (or application heartbeat) received
    last_pong_received: Option<Instant>,

    /// Number of consecutive missed pongs
    consecutive_failures: u32,

    /// Whether we're currently waiting for a pong
    waiting_for_pong: bool,
}

impl HeartbeatMonitor {
    pub(crate) fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_ping_sent: None,
            last_pong_received: None,
            consecutive_failures: 0,
            waiting_for_pong: false,
        }
    }

    /// Record that we sent a ping
    pub(crate) fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.waiting_for_pong = true;
    }

    /// Record a liveness signal: a pong frame or a recognized
    /// application-level heartbeat.
    pub(crate) fn record_pong_received(&mut self) {
        self.last_pong_received = Some(Instant::now());
        self.consecutive_failures = 0;
        self.waiting_for_pong = false;
    }

    /// Check if we should send a ping now
    pub(crate) fn should_send_ping(&self) -> bool {
        if self.waiting_for_pong {
            return false; // Don't send another ping while waiting
        }

        match self.last_ping_sent {
            None => true, // Never sent a ping
            Some(last) => last.elapsed() >= self.config.ping_interval,
        }
    }

    /// Check if the pong is overdue and record a failure if so.
    ///
    /// This method has side effects: it increments the failure counter
    /// and resets the waiting_for_pong flag when a timeout is detected.
    /// Only call this once per timeout check cycle.
    pub(crate) fn check_and_record_pong_timeout(&mut self) -> bool {
        if !self.waiting_for_pong {
            return false;
        }

        match self.last_ping_sent {
            None => false,
            Some(last) => {
                if last.elapsed() >= self.config.pong_timeout {
                    self.consecutive_failures += 1;
                    self.waiting_for_pong = false; // Reset to allow next ping
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Check if the missed-pong budget is spent and the connection should be
    /// torn down so the normal reconnect path runs.
    pub(crate) fn is_unhealthy(&self) -> bool {
        self.consecutive_failures >= self.config.failure_threshold
    }

    /// Get time until the next ping should be sent (or the pending pong
    /// deadline, whichever applies)
    pub(crate) fn time_until_next_ping(&self) -> Duration {
        if self.waiting_for_pong {
            // If waiting for pong, next action is checking for timeout
            match self.last_ping_sent {
                None => Duration::ZERO,
                Some(last) => self.config.pong_timeout.saturating_sub(last.elapsed()),
            }
        } else {
            match self.last_ping_sent {
                None => Duration::ZERO,
                Some(last) => self.config.ping_interval.saturating_sub(last.elapsed()),
            }
        }
    }

    /// Get the consecutive missed-pong count
    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
