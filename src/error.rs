use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure taxonomy shared by the transport and API layers.
///
/// This is a lightweight, copyable classification used for retry decisions,
/// log entries, and user-facing message templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Endpoint unreachable, connection refused, DNS failure
    Network,
    /// Server-side failure (5xx) or rejected request
    Server,
    /// Deadline exceeded
    Timeout,
    /// Bad or missing configuration, never retried
    Config,
    /// Caller-initiated abort, never retried
    Cancelled,
}

impl ErrorCategory {
    /// Whether errors of this category are retried automatically by default.
    ///
    /// Individual errors can override this (a 4xx response is `Server` but
    /// not retryable); the flag on [`ConnectionError`] / [`ApiError`] is
    /// authoritative.
    pub fn retries_by_default(self) -> bool {
        matches!(self, Self::Network | Self::Server | Self::Timeout)
    }
}

/// Errors produced inside the connection and API layers.
///
/// Values of this type never cross the crate boundary as-is: they are
/// classified into [`ConnectionError`] or [`ApiError`] records before being
/// surfaced or logged.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation exceeded its deadline
    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    /// Operation aborted by the caller
    #[error("cancelled")]
    Cancelled,

    /// Outbound message queue is at capacity
    #[error("send queue full ({capacity} messages)")]
    SendQueueFull { capacity: usize },

    /// Command channel to the connection task is gone
    #[error("channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Classify this error into the shared taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::WebSocket(err) => categorize_ws(err),
            Error::Http(err) => categorize_http(err),
            Error::InvalidUrl(_) | Error::Config(_) => ErrorCategory::Config,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::Cancelled => ErrorCategory::Cancelled,
            Error::SendQueueFull { .. } | Error::ChannelSend(_) => ErrorCategory::Network,
        }
    }
}

fn categorize_ws(err: &tokio_tungstenite::tungstenite::Error) -> ErrorCategory {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match err {
        WsError::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
            _ => ErrorCategory::Network,
        },
        // The server answered the upgrade request with a failure status.
        WsError::Http(_) => ErrorCategory::Server,
        WsError::Url(_) => ErrorCategory::Config,
        WsError::HttpFormat(_) => ErrorCategory::Config,
        _ => ErrorCategory::Network,
    }
}

fn categorize_http(err: &reqwest::Error) -> ErrorCategory {
    if err.is_timeout() {
        ErrorCategory::Timeout
    } else {
        ErrorCategory::Network
    }
}

/// A classified transport failure.
///
/// Produced by the connection task when an attempt fails or an established
/// connection drops; immutable once created. Consumed by the error log, the
/// statistics tracker, and the presentation layer.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct ConnectionError {
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl ConnectionError {
    pub(crate) fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            timestamp: Utc::now(),
            retryable: category.retries_by_default(),
        }
    }

    pub(crate) fn from_error(err: &Error) -> Self {
        Self::new(err.category(), err.to_string())
    }
}

/// A classified API request failure.
///
/// The uniform error half of every API outcome; raw transport errors never
/// reach callers.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
    pub category: ErrorCategory,
    pub message: String,
    pub status_code: Option<u16>,
    pub retryable: bool,
}

impl ApiError {
    pub(crate) fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status_code: None,
            retryable: category.retries_by_default(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, message)
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            format!("request timed out after {after:?}"),
        )
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(ErrorCategory::Cancelled, "request cancelled")
    }

    /// Classify a non-success HTTP status. 5xx is retryable, 4xx is not.
    pub(crate) fn from_status(status: u16) -> Self {
        let (message, retryable) = if status >= 500 {
            (format!("server error (HTTP {status})"), true)
        } else {
            (format!("request rejected (HTTP {status})"), false)
        };
        Self {
            category: ErrorCategory::Server,
            message,
            status_code: Some(status),
            retryable,
        }
    }

    pub(crate) fn from_error(err: &Error) -> Self {
        Self::new(err.category(), err.to_string())
    }
}
