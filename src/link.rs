use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use http::{HeaderName, HeaderValue};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::error::{ConnectionError, Error, ErrorCategory};
use crate::handler::{LinkHandler, LinkState};
use crate::health::HeartbeatMonitor;
use crate::session::SessionContext;
use crate::status::sanitize_url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Payload for liveness pings
const PING_PAYLOAD: &[u8] = b"gamelink";

/// Commands sent from the manager to the connection task
#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Deliver a message, queueing it while the link is down
    Send(Message),
    /// Start connecting; ignored while connected or in the failed state
    Connect,
    /// Manual retry: resets the attempt counter and connects immediately
    Retry,
    /// Close locally without reconnecting
    Disconnect,
    /// Tear the task down
    Shutdown,
}

enum IdleOutcome {
    Start,
    Shutdown,
}

enum CycleEnd {
    Disconnected,
    Failed,
    Shutdown,
}

enum WaitOutcome {
    Elapsed,
    RetryNow,
    Disconnect,
    Shutdown,
}

/// Why an established connection ended
enum LinkExit {
    /// Local disconnect; no reconnection
    Local,
    /// Shutdown command; task exits
    Shutdown,
    /// Manager dropped the command channel
    ChannelClosed,
    /// Connection lost; the retry policy takes over
    Dropped(ConnectionError),
}

/// The connection task.
///
/// Owns the socket, the offline send queue, and the retry sequence. One task
/// runs per [`crate::LinkManager`]; it idles on the command channel between
/// connection cycles, so a link can be disconnected and reconnected without
/// respawning anything.
pub(crate) struct LinkTask<H: LinkHandler> {
    handler: Arc<H>,
    config: LinkConfig,
    ctx: Arc<SessionContext>,
    command_rx: mpsc::Receiver<LinkCommand>,
    queue: VecDeque<Message>,
    /// Whether this session has ever had an established connection
    has_connected: bool,
}

impl<H: LinkHandler> LinkTask<H> {
    pub(crate) fn new(
        handler: Arc<H>,
        config: LinkConfig,
        ctx: Arc<SessionContext>,
        command_rx: mpsc::Receiver<LinkCommand>,
    ) -> Self {
        Self {
            handler,
            config,
            ctx,
            command_rx,
            queue: VecDeque::new(),
            has_connected: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("link task started");
        let mut failed = false;
        loop {
            match self.idle(failed).await {
                IdleOutcome::Start => {}
                IdleOutcome::Shutdown => break,
            }
            failed = match self.run_cycle().await {
                CycleEnd::Disconnected => false,
                CycleEnd::Failed => true,
                CycleEnd::Shutdown => break,
            };
        }
        debug!("link task stopped");
    }

    /// Wait for a command that starts a connection cycle.
    ///
    /// In the terminal failed state only a manual retry starts one; plain
    /// connect commands are ignored so the state sticks until the user acts.
    async fn idle(&mut self, failed: bool) -> IdleOutcome {
        let mut failed = failed;
        loop {
            match self.command_rx.recv().await {
                Some(LinkCommand::Connect) => {
                    if failed {
                        debug!("connect ignored in failed state; use retry_connection");
                    } else {
                        return IdleOutcome::Start;
                    }
                }
                Some(LinkCommand::Retry) => return IdleOutcome::Start,
                Some(LinkCommand::Send(message)) => self.queue_message(message),
                Some(LinkCommand::Disconnect) => {
                    if failed {
                        // Explicit disconnect clears the terminal state
                        self.ctx.mark_disconnected();
                        failed = false;
                    }
                }
                Some(LinkCommand::Shutdown) | None => return IdleOutcome::Shutdown,
            }
        }
    }

    /// One connection cycle: attempts, automatic retries, and the connected
    /// phase, until the link closes locally, fails terminally, or shuts down.
    async fn run_cycle(&mut self) -> CycleEnd {
        let max = self.config.connection.max_reconnect_attempts;
        let notice_after = self.config.connection.notice_after_attempts;
        // Automatic retry about to run; 0 means an immediate fresh attempt
        let mut retry: u32 = 0;

        loop {
            if retry > 0 {
                let delay = self.config.backoff.delay_for_attempt(retry - 1);
                self.ctx.mark_reconnect_wait(retry, max, delay);
                debug!(attempt = retry, ?delay, "waiting before reconnect attempt");
                match self.wait_backoff(delay).await {
                    WaitOutcome::Elapsed => {}
                    WaitOutcome::RetryNow => {
                        info!("manual retry requested during backoff");
                        retry = 0;
                        continue;
                    }
                    WaitOutcome::Disconnect => {
                        info!("reconnection cancelled by disconnect");
                        self.ctx.mark_disconnected();
                        return CycleEnd::Disconnected;
                    }
                    WaitOutcome::Shutdown => return CycleEnd::Shutdown,
                }
            } else {
                self.ctx.mark_connecting();
            }

            let state = LinkState {
                is_reconnect: self.has_connected,
                attempt: retry,
            };
            let url = self.handler.url(&state).await;
            let headers = self.handler.connection_headers(&state).await;

            self.ctx.record_connect_attempt();
            let started = Instant::now();
            match self.try_connect(&url, headers).await {
                Ok(stream) => {
                    let connect_time = started.elapsed();
                    self.ctx.mark_connected(connect_time);
                    info!(?connect_time, url = %sanitize_url(&url), "link established");
                    self.has_connected = true;
                    retry = 0;

                    match self.drive(stream, &state).await {
                        LinkExit::Local => {
                            info!("link closed by local disconnect");
                            self.ctx.mark_disconnected();
                            self.handler.on_disconnect(&state).await;
                            return CycleEnd::Disconnected;
                        }
                        LinkExit::Shutdown => {
                            self.ctx.mark_disconnected();
                            self.handler.on_disconnect(&state).await;
                            return CycleEnd::Shutdown;
                        }
                        LinkExit::ChannelClosed => {
                            self.ctx.mark_disconnected();
                            return CycleEnd::Shutdown;
                        }
                        LinkExit::Dropped(err) => {
                            warn!(category = ?err.category, "link lost: {}", err.message);
                            // Not an attempt failure; the connect succeeded
                            self.ctx.record_connection_error(&err, 0, Some(&url));
                            self.handler.on_disconnect(&state).await;
                            retry = 1;
                        }
                    }
                }
                Err(e) => {
                    let err = ConnectionError::from_error(&e);
                    warn!(
                        attempt = retry + 1,
                        category = ?err.category,
                        "connection attempt failed: {}", err.message
                    );
                    self.ctx.record_connection_error(&err, retry + 1, Some(&url));

                    if retry >= max {
                        error!(attempts = max, "automatic reconnect attempts exhausted");
                        self.ctx.mark_failed();
                        return CycleEnd::Failed;
                    }
                    if retry >= notice_after {
                        self.ctx.set_reconnect_notice(true);
                    }
                    retry += 1;
                }
            }
        }
    }

    /// Sleep out a backoff delay while staying responsive to commands.
    async fn wait_backoff(&mut self, delay: Duration) -> WaitOutcome {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                command = self.command_rx.recv() => match command {
                    Some(LinkCommand::Send(message)) => self.queue_message(message),
                    Some(LinkCommand::Retry) => return WaitOutcome::RetryNow,
                    Some(LinkCommand::Connect) => {
                        // A retry is already scheduled
                    }
                    Some(LinkCommand::Disconnect) => return WaitOutcome::Disconnect,
                    Some(LinkCommand::Shutdown) | None => return WaitOutcome::Shutdown,
                }
            }
        }
    }

    async fn try_connect(
        &self,
        url: &str,
        headers: Vec<(HeaderName, HeaderValue)>,
    ) -> Result<WsStream, Error> {
        let mut request = url.into_client_request()?;
        for (name, value) in headers {
            request.headers_mut().insert(name, value);
        }

        let connect_timeout = self.config.connection.connect_timeout;
        match timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(Error::WebSocket(e)),
            Err(_) => Err(Error::Timeout {
                after: connect_timeout,
            }),
        }
    }

    /// Run an established connection until it ends.
    async fn drive(&mut self, stream: WsStream, state: &LinkState) -> LinkExit {
        let (mut write, mut read) = stream.split();

        // Handler greeting (resubscription) goes out first, then the
        // offline queue, oldest message first
        for message in self.handler.on_connect(state).await {
            if let Err(e) = write.send(message).await {
                return LinkExit::Dropped(ConnectionError::from_error(&Error::WebSocket(e)));
            }
        }
        let queued = self.queue.len();
        while let Some(message) = self.queue.front() {
            if let Err(e) = write.send(message.clone()).await {
                // Unsent messages stay queued for the next connection
                return LinkExit::Dropped(ConnectionError::from_error(&Error::WebSocket(e)));
            }
            self.queue.pop_front();
        }
        if queued > 0 {
            debug!(count = queued, "flushed queued messages");
        }

        let mut heartbeat = if self.config.heartbeat.enabled {
            Some(HeartbeatMonitor::new(self.config.heartbeat.clone()))
        } else {
            None
        };

        loop {
            // Cap the tick so pong deadlines are noticed promptly
            let tick = heartbeat
                .as_ref()
                .map(|monitor| monitor.time_until_next_ping().min(Duration::from_secs(1)))
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return LinkExit::Dropped(ConnectionError::new(
                                ErrorCategory::Network,
                                "failed to answer ping",
                            ));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        if let Some(monitor) = heartbeat.as_mut() {
                            monitor.record_pong_received();
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "close frame received");
                        return LinkExit::Dropped(ConnectionError::new(
                            ErrorCategory::Server,
                            "server closed the connection",
                        ));
                    }
                    Some(Ok(message)) => {
                        if self.handler.is_heartbeat(&message) {
                            if let Some(monitor) = heartbeat.as_mut() {
                                monitor.record_pong_received();
                            }
                        }
                        self.handler.on_message(message, state).await;
                    }
                    Some(Err(e)) => {
                        return LinkExit::Dropped(ConnectionError::from_error(&Error::WebSocket(e)));
                    }
                    None => {
                        return LinkExit::Dropped(ConnectionError::new(
                            ErrorCategory::Network,
                            "connection closed unexpectedly",
                        ));
                    }
                },
                command = self.command_rx.recv() => match command {
                    Some(LinkCommand::Send(message)) => {
                        if let Err(e) = write.send(message.clone()).await {
                            // Keep the message; it flushes after reconnect
                            self.queue_message(message);
                            return LinkExit::Dropped(ConnectionError::from_error(&Error::WebSocket(e)));
                        }
                    }
                    Some(LinkCommand::Connect) | Some(LinkCommand::Retry) => {
                        // Already connected
                    }
                    Some(LinkCommand::Disconnect) => {
                        let _ = write.send(Message::Close(None)).await;
                        return LinkExit::Local;
                    }
                    Some(LinkCommand::Shutdown) => {
                        let _ = write.send(Message::Close(None)).await;
                        return LinkExit::Shutdown;
                    }
                    None => return LinkExit::ChannelClosed,
                },
                _ = tokio::time::sleep(tick), if heartbeat.is_some() => {
                    if let Some(monitor) = heartbeat.as_mut() {
                        if monitor.check_and_record_pong_timeout() {
                            warn!(
                                failures = monitor.consecutive_failures(),
                                "pong overdue"
                            );
                            if monitor.is_unhealthy() {
                                return LinkExit::Dropped(ConnectionError::new(
                                    ErrorCategory::Timeout,
                                    "heartbeat timed out",
                                ));
                            }
                        }
                        if monitor.should_send_ping() {
                            if write.send(Message::Ping(PING_PAYLOAD.to_vec())).await.is_err() {
                                return LinkExit::Dropped(ConnectionError::new(
                                    ErrorCategory::Network,
                                    "failed to send ping",
                                ));
                            }
                            monitor.record_ping_sent();
                        }
                    }
                }
            }
        }
    }

    /// Queue an outbound message while the link is down, dropping the oldest
    /// once the capacity is reached. Newest game state wins.
    fn queue_message(&mut self, message: Message) {
        if self.queue.len() >= self.config.send_queue_capacity {
            self.queue.pop_front();
            warn!(
                capacity = self.config.send_queue_capacity,
                "send queue full, dropping oldest message"
            );
        }
        self.queue.push_back(message);
    }
}
