//! # gamelink
//!
//! Connection resilience for realtime game clients: an auto-reconnecting
//! WebSocket link plus an HTTP API service with retries, deduplication,
//! and cancellation, reporting into one shared session.
//!
//! ## Features
//!
//! - **Auto-reconnection** with exponential backoff (1s up to 16s between
//!   attempts), a player-facing notice once reconnection drags on, and a
//!   terminal failed state after the retry budget is spent
//! - **Outbound queueing** - messages sent while the link is down are held
//!   and flushed in order on reconnect
//! - **API retries** with per-request timeouts, in-flight deduplication of
//!   identical requests, and cooperative cancellation
//! - **Session context** shared between the link and the API service:
//!   status, statistics, pending request count, and a bounded error log
//! - **Status presentation** mapping errors and link state to indicator
//!   colors, toasts, and modals without leaking internal detail
//!
//! ## Example
//!
//! ```ignore
//! use gamelink::{LinkConfig, LinkHandler, LinkManager, LinkState, Message};
//!
//! struct GameHandler;
//!
//! impl LinkHandler for GameHandler {
//!     async fn url(&self, _state: &LinkState) -> String {
//!         "wss://play.example.io/ws".to_string()
//!     }
//!
//!     async fn on_message(&self, message: Message, _state: &LinkState) {
//!         // apply server updates
//!     }
//! }
//!
//! let config = LinkConfig::builder().build()?;
//! let manager = LinkManager::new(config, GameHandler);
//! manager.connect().await?;
//! manager.send(Message::Text("{\"op\":\"move\"}".into()))?;
//! ```

mod api;
mod config;
mod error;
mod handler;
mod health;
mod link;
mod log;
mod manager;
mod session;
mod stats;
mod status;

pub use api::{ApiResponse, ApiService, ApiTicket, RequestId};
pub use config::{
    ApiConfig, BackoffConfig, ConfigError, ConnectionConfig, HeartbeatConfig, LinkConfig,
    ENV_API_RETRY_ATTEMPTS, ENV_API_RETRY_DELAY_MS, ENV_API_TIMEOUT_MS, ENV_API_URL,
    ENV_CHAIN_RPC_URL, ENV_CONTRACT_ADDRESS,
};
pub use error::{ApiError, ConnectionError, Error, ErrorCategory};
pub use handler::{LinkHandler, LinkState};
pub use log::{ErrorLogEntry, ErrorSource, LogContext};
pub use manager::LinkManager;
pub use session::{LinkStatus, SessionContext, SessionSnapshot};
pub use stats::ConnectionStats;
pub use status::{
    indicator, present_api_error, present_connection_error, sanitize_url, IndicatorColor,
    Presentation, StatusIndicator, TOAST_DISMISS_AFTER,
};

// Re-export http types for connection_headers and request methods
pub use http::{HeaderName, HeaderValue, Method};
// Re-export the WebSocket message type handlers work with
pub use tokio_tungstenite::tungstenite::Message;

/// Result type for gamelink operations
pub type Result<T> = std::result::Result<T, Error>;
