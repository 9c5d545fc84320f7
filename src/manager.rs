use crate::config::LinkConfig;
use crate::error::Error;
use crate::handler::LinkHandler;
use crate::link::{LinkCommand, LinkTask};
use crate::session::{LinkStatus, SessionContext, SessionSnapshot};
use crate::stats::ConnectionStats;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Manages a single auto-reconnecting WebSocket link to the game server.
///
/// The manager owns a background task that runs the connection lifecycle:
/// connect, read, reconnect with backoff, and give up after the retry
/// budget is exhausted. Callers interact through commands (`connect`,
/// `send`, `disconnect`) and observe the link through the shared
/// [`SessionContext`].
///
/// # Thread Safety
///
/// `LinkManager` is `Send + Sync` and all methods can be safely called from
/// multiple tasks concurrently. Internal state is protected by
/// `parking_lot::Mutex` which does not poison on panic.
pub struct LinkManager<H: LinkHandler> {
    handler: Arc<H>,
    config: LinkConfig,
    ctx: Arc<SessionContext>,
    command_tx: mpsc::Sender<LinkCommand>,
    /// Receiver handed to the link task on first spawn
    command_rx: Mutex<Option<mpsc::Receiver<LinkCommand>>>,
    /// Handle of the spawned link task, if any
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<H: LinkHandler> LinkManager<H> {
    /// Create a new link manager with its own session context.
    pub fn new(config: LinkConfig, handler: H) -> Self {
        Self::with_context(config, handler, Arc::new(SessionContext::new()))
    }

    /// Create a link manager that shares a session context.
    ///
    /// Use this when an [`crate::ApiService`] should report into the same
    /// session, so status consumers see connection and request state
    /// side by side.
    pub fn with_context(config: LinkConfig, handler: H, ctx: Arc<SessionContext>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.send_queue_capacity);
        Self {
            handler: Arc::new(handler),
            config,
            ctx,
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            task: Mutex::new(None),
        }
    }

    /// Start connecting to the game server.
    ///
    /// Spawns the link task on first use. Calling this while already
    /// connected or connecting is a no-op, and after the link has given
    /// up (status [`LinkStatus::Failed`]) the command is ignored; use
    /// [`Self::retry_connection`] to leave the failed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the link task has shut down.
    pub async fn connect(&self) -> Result<(), Error> {
        self.ensure_task();
        self.command_tx
            .send(LinkCommand::Connect)
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Retry after the link has given up.
    ///
    /// Resets the automatic retry counter and connects immediately,
    /// skipping any backoff delay in progress. Works from any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the link task has shut down.
    pub async fn retry_connection(&self) -> Result<(), Error> {
        self.ensure_task();
        self.command_tx
            .send(LinkCommand::Retry)
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Close the connection without reconnecting.
    ///
    /// The link stays down until the next [`Self::connect`] call.
    ///
    /// # Errors
    ///
    /// Returns an error if the link task has shut down.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.command_tx
            .send(LinkCommand::Disconnect)
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Send a message over the link.
    ///
    /// While the link is down the message is queued and flushed in order
    /// once a connection is established. The queue holds
    /// `send_queue_capacity` messages; beyond that the oldest queued
    /// message is dropped to make room.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendQueueFull`] when the command channel is full
    /// (the link task is not keeping up), or [`Error::ChannelSend`] if the
    /// task has shut down.
    pub fn send(&self, message: Message) -> Result<(), Error> {
        self.command_tx
            .try_send(LinkCommand::Send(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::SendQueueFull {
                    capacity: self.config.send_queue_capacity,
                },
                mpsc::error::TrySendError::Closed(_) => {
                    Error::ChannelSend("link task is gone".to_string())
                }
            })
    }

    /// Shut the link down and wait for the task to finish.
    ///
    /// Closes any open connection first. The manager cannot be restarted
    /// afterwards; build a new one to reconnect.
    pub async fn shutdown(&self) {
        if self.command_tx.send(LinkCommand::Shutdown).await.is_err() {
            debug!("link task already gone during shutdown");
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Current link status.
    pub fn status(&self) -> LinkStatus {
        self.ctx.status()
    }

    /// Subscribe to status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.ctx.subscribe()
    }

    /// Snapshot of the session for rendering.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.ctx.snapshot()
    }

    /// Connection statistics.
    pub fn stats(&self) -> ConnectionStats {
        self.ctx.stats()
    }

    /// The shared session context.
    pub fn context(&self) -> Arc<SessionContext> {
        self.ctx.clone()
    }

    /// Get a reference to the handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Spawn the link task if it is not already running.
    fn ensure_task(&self) {
        let mut task = self.task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        // The receiver is consumed by the first spawn. If the task exited
        // after that, the channel is closed and commands fail upstream.
        let Some(command_rx) = self.command_rx.lock().take() else {
            return;
        };
        let link = LinkTask::new(
            self.handler.clone(),
            self.config.clone(),
            self.ctx.clone(),
            command_rx,
        );
        *task = Some(tokio::spawn(link.run()));
    }
}

impl<H: LinkHandler> Drop for LinkManager<H> {
    fn drop(&mut self) {
        // Abort the link task to prevent it from outliving the manager
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::LinkState;
    use crate::session::LinkStatus;

    struct TestHandler;

    impl LinkHandler for TestHandler {
        async fn url(&self, _state: &LinkState) -> String {
            "ws://127.0.0.1:9".to_string()
        }

        async fn on_message(&self, _message: Message, _state: &LinkState) {}
    }

    fn small_queue_config(capacity: usize) -> LinkConfig {
        LinkConfig::builder()
            .send_queue_capacity(capacity)
            .build()
            .expect("valid config")
    }

    #[test]
    fn test_initial_status_disconnected() {
        let manager = LinkManager::new(LinkConfig::default(), TestHandler);
        assert_eq!(manager.status(), LinkStatus::Disconnected);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.status, LinkStatus::Disconnected);
        assert_eq!(snapshot.pending_requests, 0);
        assert!(snapshot.env_valid);
        assert!(!snapshot.show_reconnect_notice);
        assert!(!snapshot.show_modal);
    }

    #[test]
    fn test_send_before_connect_is_buffered() {
        let manager = LinkManager::new(LinkConfig::default(), TestHandler);
        // No task is running yet; the command channel holds the message
        // until the link connects and flushes its queue.
        manager
            .send(Message::Text("hello".to_string()))
            .expect("buffered send");
    }

    #[test]
    fn test_send_queue_full() {
        let manager = LinkManager::new(small_queue_config(2), TestHandler);
        manager.send(Message::Text("a".to_string())).unwrap();
        manager.send(Message::Text("b".to_string())).unwrap();

        let err = manager.send(Message::Text("c".to_string())).unwrap_err();
        match err {
            Error::SendQueueFull { capacity } => assert_eq!(capacity, 2),
            other => panic!("expected SendQueueFull, got {other:?}"),
        }
    }

    #[test]
    fn test_stats_start_empty() {
        let manager = LinkManager::new(LinkConfig::default(), TestHandler);
        let stats = manager.stats();
        assert_eq!(stats.total_attempts, 0);
        assert_eq!(stats.successful_connections, 0);
        assert!(stats.last_connected_at.is_none());
        assert!(stats.average_connect_time.is_none());
    }
}
