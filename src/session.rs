use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ApiError, ConnectionError};
use crate::log::{ErrorLog, ErrorLogEntry, ErrorSource, LogContext};
use crate::stats::{ConnectionStats, StatsTracker};
use crate::status::sanitize_url;

/// Connection lifecycle of the realtime link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    /// No connection and none in progress
    Disconnected,
    /// First connection attempt (or manual retry) in progress
    Connecting,
    /// Link established
    Connected,
    /// Link lost; automatic retry `attempt` is scheduled or running
    Reconnecting { attempt: u32 },
    /// Automatic retries exhausted; waits for an explicit manual retry
    Failed,
}

/// Shared per-session state for the link, the API service, and any UI.
///
/// One context is created per client session and handed to the components
/// that need it, so tests can build a fresh one and observe exactly what a
/// scenario produced. All mutation goes through the methods below; writes
/// from the connection task arrive in transition order.
#[derive(Debug)]
pub struct SessionContext {
    status_tx: watch::Sender<LinkStatus>,
    stats: StatsTracker,
    log: ErrorLog,
    pending_requests: AtomicUsize,
    env_valid: AtomicBool,
    reconnect_notice: AtomicBool,
    inner: RwLock<SessionInner>,
}

#[derive(Debug, Default)]
struct SessionInner {
    last_connection_error: Option<ConnectionError>,
    last_api_error: Option<ApiError>,
    reconnect_attempt: u32,
    next_retry_at: Option<DateTime<Utc>>,
    progress: Option<String>,
}

/// Point-in-time view of the session, shaped for presentation
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: LinkStatus,
    pub last_connection_error: Option<ConnectionError>,
    pub last_api_error: Option<ApiError>,
    /// Automatic retry currently scheduled or running (0 when idle)
    pub reconnect_attempt: u32,
    /// When the next automatic retry fires, if one is scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
    /// In-flight API requests
    pub pending_requests: usize,
    /// False once environment validation has failed
    pub env_valid: bool,
    /// Raised after repeated reconnect failures while retries continue
    pub show_reconnect_notice: bool,
    /// Terminal failure: surface a blocking dialog with a retry action
    pub show_modal: bool,
    /// Short human-readable note about what the link is doing
    pub progress: Option<String>,
}

impl SessionContext {
    pub fn new() -> Self {
        let (status_tx, _rx) = watch::channel(LinkStatus::Disconnected);
        Self {
            status_tx,
            stats: StatsTracker::default(),
            log: ErrorLog::default(),
            pending_requests: AtomicUsize::new(0),
            env_valid: AtomicBool::new(true),
            reconnect_notice: AtomicBool::new(false),
            inner: RwLock::new(SessionInner::default()),
        }
    }

    /// Current link status
    pub fn status(&self) -> LinkStatus {
        *self.status_tx.borrow()
    }

    /// Subscribe to status transitions.
    ///
    /// The receiver observes the latest status; intermediate values may be
    /// skipped under fast transitions, which is what a UI binding wants.
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    /// Connection statistics so far
    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// Retained error log, oldest first
    pub fn error_log(&self) -> Vec<ErrorLogEntry> {
        self.log.entries()
    }

    /// Number of API requests currently in flight
    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::Acquire)
    }

    /// Whether the last environment validation passed
    pub fn env_valid(&self) -> bool {
        self.env_valid.load(Ordering::Acquire)
    }

    /// Whether the repeated-failure notice is currently raised
    pub fn reconnect_notice(&self) -> bool {
        self.reconnect_notice.load(Ordering::Acquire)
    }

    /// Full presentation-ready snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        let inner = self.inner.read();
        SessionSnapshot {
            status,
            last_connection_error: inner.last_connection_error.clone(),
            last_api_error: inner.last_api_error.clone(),
            reconnect_attempt: inner.reconnect_attempt,
            next_retry_at: inner.next_retry_at,
            pending_requests: self.pending_requests(),
            env_valid: self.env_valid(),
            show_reconnect_notice: self.reconnect_notice(),
            show_modal: status == LinkStatus::Failed,
            progress: inner.progress.clone(),
        }
    }

    // --- transitions driven by the connection task ---

    pub(crate) fn mark_connecting(&self) {
        {
            let mut inner = self.inner.write();
            inner.reconnect_attempt = 0;
            inner.next_retry_at = None;
            inner.progress = Some("Connecting to game server".to_string());
        }
        self.status_tx.send_replace(LinkStatus::Connecting);
    }

    pub(crate) fn mark_reconnect_wait(&self, attempt: u32, max: u32, delay: Duration) {
        {
            let mut inner = self.inner.write();
            inner.reconnect_attempt = attempt;
            inner.next_retry_at =
                Some(Utc::now() + TimeDelta::from_std(delay).unwrap_or_default());
            inner.progress = Some(format!("Reconnecting (attempt {attempt} of {max})"));
        }
        self.status_tx.send_replace(LinkStatus::Reconnecting { attempt });
    }

    pub(crate) fn mark_connected(&self, connect_time: Duration) {
        self.stats.record_success(connect_time);
        self.log.mark_resolved(ErrorSource::Socket);
        self.reconnect_notice.store(false, Ordering::Release);
        {
            let mut inner = self.inner.write();
            inner.last_connection_error = None;
            inner.reconnect_attempt = 0;
            inner.next_retry_at = None;
            inner.progress = None;
        }
        self.status_tx.send_replace(LinkStatus::Connected);
    }

    pub(crate) fn mark_disconnected(&self) {
        self.reconnect_notice.store(false, Ordering::Release);
        {
            let mut inner = self.inner.write();
            inner.reconnect_attempt = 0;
            inner.next_retry_at = None;
            inner.progress = None;
        }
        self.status_tx.send_replace(LinkStatus::Disconnected);
    }

    pub(crate) fn mark_failed(&self) {
        // The terminal dialog supersedes the transient notice
        self.reconnect_notice.store(false, Ordering::Release);
        {
            let mut inner = self.inner.write();
            inner.next_retry_at = None;
            inner.progress = None;
        }
        self.status_tx.send_replace(LinkStatus::Failed);
    }

    pub(crate) fn set_reconnect_notice(&self, on: bool) {
        self.reconnect_notice.store(on, Ordering::Release);
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.stats.record_attempt();
    }

    pub(crate) fn record_connection_error(
        &self,
        error: &ConnectionError,
        attempt: u32,
        url: Option<&str>,
    ) {
        self.inner.write().last_connection_error = Some(error.clone());
        self.log.record(
            ErrorSource::Socket,
            error.category,
            error.message.clone(),
            LogContext {
                url: url.map(sanitize_url),
                attempt,
            },
        );
    }

    // --- API service bookkeeping ---

    pub(crate) fn record_api_error(&self, error: &ApiError, url: &str, attempt: u32) {
        self.inner.write().last_api_error = Some(error.clone());
        self.log.record(
            ErrorSource::Api,
            error.category,
            error.message.clone(),
            LogContext {
                url: Some(sanitize_url(url)),
                attempt,
            },
        );
    }

    pub(crate) fn record_api_success(&self) {
        self.log.mark_resolved(ErrorSource::Api);
        self.inner.write().last_api_error = None;
    }

    pub(crate) fn set_env_valid(&self, valid: bool) {
        self.env_valid.store(valid, Ordering::Release);
    }

    pub(crate) fn pending_inc(&self) {
        self.pending_requests.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pending_dec(&self) {
        let result = self
            .pending_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            debug!("pending request counter already at zero");
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}
