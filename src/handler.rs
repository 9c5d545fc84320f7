use std::future::Future;

use http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;

/// Connection state information passed to handlers
#[derive(Debug, Clone)]
pub struct LinkState {
    /// Whether a previous connection existed in this session
    pub is_reconnect: bool,
    /// Automatic retry this attempt belongs to (0 for a fresh or manual connect)
    pub attempt: u32,
}

/// Trait that users implement to plug game behavior into the link.
///
/// The link owns connecting, retrying, and offline queueing; the handler
/// supplies the endpoint, any handshake headers, what to (re)send right after
/// connecting, and what to do with inbound traffic.
///
/// # Example
///
/// ```ignore
/// use gamelink::{LinkHandler, LinkState, Message};
///
/// struct GameHandler {
///     session_token: String,
/// }
///
/// impl LinkHandler for GameHandler {
///     async fn url(&self, _state: &LinkState) -> String {
///         "wss://play.example.io/ws".to_string()
///     }
///
///     async fn on_connect(&self, state: &LinkState) -> Vec<Message> {
///         // Rejoin the match after a reconnect, join fresh otherwise
///         let op = if state.is_reconnect { "rejoin" } else { "join" };
///         vec![Message::Text(format!(
///             r#"{{"op":"{op}","token":"{}"}}"#,
///             self.session_token
///         ))]
///     }
///
///     async fn on_message(&self, message: Message, _state: &LinkState) {
///         // Apply server updates to the local game state
///     }
/// }
/// ```
pub trait LinkHandler: Send + Sync + 'static {
    /// Returns the WebSocket URL to connect to.
    ///
    /// Called before each connection attempt, so rotating endpoints or
    /// refreshed auth tickets are picked up on reconnect.
    fn url(&self, state: &LinkState) -> impl Future<Output = String> + Send;

    /// Returns extra headers for the connection handshake.
    fn connection_headers(
        &self,
        _state: &LinkState,
    ) -> impl Future<Output = Vec<(HeaderName, HeaderValue)>> + Send {
        async { Vec::new() }
    }

    /// Called after a successful connection.
    ///
    /// Returns messages to send immediately after the handshake, before any
    /// queued traffic is flushed. This is where resubscription goes.
    fn on_connect(&self, _state: &LinkState) -> impl Future<Output = Vec<Message>> + Send {
        async { Vec::new() }
    }

    /// Called when a message is received.
    fn on_message(&self, message: Message, state: &LinkState) -> impl Future<Output = ()> + Send;

    /// Called when an established connection goes away, whether it dropped
    /// or was closed locally. Not called for attempts that never completed
    /// the handshake.
    fn on_disconnect(&self, _state: &LinkState) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Returns `true` if the message is a valid application-level heartbeat.
    ///
    /// Some game protocols send their own heartbeat beyond WebSocket pings.
    /// Recognized heartbeats count as liveness for the pong deadline and are
    /// still delivered to [`LinkHandler::on_message`].
    fn is_heartbeat(&self, _message: &Message) -> bool {
        false
    }
}
