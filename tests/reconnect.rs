//! Connection lifecycle tests against a local WebSocket server.
//!
//! Each test binds a listener on an ephemeral port and plays the server
//! side by hand: accepting, refusing, or dropping connections to drive
//! the link through its reconnect policy.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use gamelink::{
    indicator, BackoffConfig, ConnectionConfig, ErrorCategory, ErrorSource, HeartbeatConfig,
    IndicatorColor, LinkConfig, LinkHandler, LinkManager, LinkState, LinkStatus, Message,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

struct TestHandler {
    url: String,
}

impl TestHandler {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

impl LinkHandler for TestHandler {
    async fn url(&self, _state: &LinkState) -> String {
        self.url.clone()
    }

    async fn on_message(&self, _message: Message, _state: &LinkState) {}
}

/// Handler whose target URL can be repointed mid-test.
struct SwitchableHandler {
    target: Mutex<String>,
}

impl LinkHandler for SwitchableHandler {
    async fn url(&self, _state: &LinkState) -> String {
        self.target.lock().unwrap().clone()
    }

    async fn on_message(&self, _message: Message, _state: &LinkState) {}
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    (listener, url)
}

/// Millisecond-scale delays so a full retry sequence fits in a test run.
fn fast_config() -> LinkConfig {
    LinkConfig::builder()
        .connection(ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(160),
            multiplier: 2.0,
            jitter: false,
        })
        .heartbeat(HeartbeatConfig {
            enabled: false,
            ..Default::default()
        })
        .build()
        .expect("valid test config")
}

async fn recv_text(ws: &mut ServerWs) -> String {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("message within deadline")
            .expect("stream still open")
            .expect("clean frame");
        if let Message::Text(text) = message {
            return text;
        }
    }
}

#[tokio::test]
async fn link_reconnects_after_server_drop() {
    let (listener, url) = bind().await;
    let manager = LinkManager::new(fast_config(), TestHandler::new(&url));
    let mut status = manager.subscribe_status();

    manager.connect().await.unwrap();

    let (socket, _) = listener.accept().await.unwrap();
    let ws = accept_async(socket).await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    // Server goes away without a close handshake
    drop(ws);
    status
        .wait_for(|s| matches!(s, LinkStatus::Reconnecting { .. }))
        .await
        .unwrap();

    // First retry reaches a socket that dies before the handshake finishes
    let (socket, _) = listener.accept().await.unwrap();
    drop(socket);

    // Second retry gets a real server again
    let (socket, _) = listener.accept().await.unwrap();
    let _ws = accept_async(socket).await.unwrap();

    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == LinkStatus::Connected),
    )
    .await
    .expect("reconnected within deadline")
    .unwrap();

    // Initial connect, failed retry, successful retry
    let stats = manager.stats();
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.successful_connections, 2);
    assert!(stats.average_connect_time.is_some());

    // The outage was logged, and the reconnect resolved every socket entry
    let log = manager.context().error_log();
    assert!(log.len() >= 2);
    assert!(log.iter().all(|entry| entry.source == ErrorSource::Socket));
    assert!(log.iter().all(|entry| entry.resolved));

    manager.shutdown().await;
}

#[tokio::test]
async fn link_gives_up_after_retry_budget() {
    // Bind then drop so the port refuses connections
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let manager = LinkManager::new(fast_config(), TestHandler::new(&url));
    let mut status = manager.subscribe_status();

    let started = Instant::now();
    manager.connect().await.unwrap();

    // The repeated-failure notice goes up while retries are still running
    status
        .wait_for(|s| matches!(s, LinkStatus::Reconnecting { attempt } if *attempt >= 4))
        .await
        .unwrap();
    assert!(manager.snapshot().show_reconnect_notice);

    status
        .wait_for(|s| *s == LinkStatus::Failed)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // Initial attempt plus five automatic retries
    let stats = manager.stats();
    assert_eq!(stats.total_attempts, 6);
    assert_eq!(stats.successful_connections, 0);

    // Retries were spaced by doubling delays (10+20+40+80+160 ms)
    assert!(
        elapsed >= Duration::from_millis(250),
        "gave up too quickly: {elapsed:?}"
    );

    let snapshot = manager.snapshot();
    assert!(snapshot.show_modal);
    assert!(!snapshot.show_reconnect_notice);
    assert!(snapshot.last_connection_error.is_some());

    let badge = indicator(snapshot.status);
    assert_eq!(badge.color, IndicatorColor::Red);
    assert!(badge.click_to_retry);

    let log = manager.context().error_log();
    assert_eq!(log.len(), 6);
    assert!(log.iter().all(|e| e.source == ErrorSource::Socket && !e.resolved));

    manager.shutdown().await;
}

#[tokio::test]
async fn manual_retry_recovers_from_failed() {
    // Nothing ever listens here
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("ws://{}/ws", dead.local_addr().unwrap());
    drop(dead);

    let config = LinkConfig::builder()
        .connection(ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            max_reconnect_attempts: 2,
            notice_after_attempts: 1,
        })
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: false,
        })
        .heartbeat(HeartbeatConfig {
            enabled: false,
            ..Default::default()
        })
        .build()
        .unwrap();

    let handler = SwitchableHandler {
        target: Mutex::new(dead_url),
    };
    let manager = LinkManager::new(config, handler);
    let mut status = manager.subscribe_status();

    manager.connect().await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Failed)
        .await
        .unwrap();

    // A real server comes up and the handler is pointed at it
    let (listener, url) = bind().await;
    *manager.handler().target.lock().unwrap() = url;

    // connect() must not leave the terminal state
    manager.connect().await.unwrap();
    let accepted = timeout(Duration::from_millis(150), listener.accept()).await;
    assert!(accepted.is_err(), "connect() escaped the failed state");
    assert_eq!(manager.status(), LinkStatus::Failed);

    // The explicit retry does
    manager.retry_connection().await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let _ws = accept_async(socket).await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    assert!(!manager.snapshot().show_modal);

    manager.shutdown().await;
}

#[tokio::test]
async fn queued_messages_flush_in_order_on_connect() {
    let (listener, url) = bind().await;
    let manager = LinkManager::new(fast_config(), TestHandler::new(&url));

    manager.send(Message::Text("first".to_string())).unwrap();
    manager.send(Message::Text("second".to_string())).unwrap();
    manager.connect().await.unwrap();

    let (socket, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(socket).await.unwrap();

    assert_eq!(recv_text(&mut ws).await, "first");
    assert_eq!(recv_text(&mut ws).await, "second");

    manager.shutdown().await;
}

#[tokio::test]
async fn messages_sent_during_outage_arrive_after_reconnect() {
    let (listener, url) = bind().await;
    let manager = LinkManager::new(fast_config(), TestHandler::new(&url));
    let mut status = manager.subscribe_status();

    manager.connect().await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let ws = accept_async(socket).await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    drop(ws);
    status
        .wait_for(|s| matches!(s, LinkStatus::Reconnecting { .. }))
        .await
        .unwrap();

    manager
        .send(Message::Text("queued during outage".to_string()))
        .unwrap();

    let (socket, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(socket).await.unwrap();
    assert_eq!(recv_text(&mut ws).await, "queued during outage");

    manager.shutdown().await;
}

#[tokio::test]
async fn handler_greeting_distinguishes_reconnects() {
    struct RejoinHandler {
        url: String,
    }

    impl LinkHandler for RejoinHandler {
        async fn url(&self, _state: &LinkState) -> String {
            self.url.clone()
        }

        async fn on_connect(&self, state: &LinkState) -> Vec<Message> {
            let op = if state.is_reconnect { "rejoin" } else { "join" };
            vec![Message::Text(op.to_string())]
        }

        async fn on_message(&self, _message: Message, _state: &LinkState) {}
    }

    let (listener, url) = bind().await;
    let manager = LinkManager::new(fast_config(), RejoinHandler { url });
    let mut status = manager.subscribe_status();

    manager.connect().await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(socket).await.unwrap();
    assert_eq!(recv_text(&mut ws).await, "join");
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    drop(ws);

    let (socket, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(socket).await.unwrap();
    assert_eq!(recv_text(&mut ws).await, "rejoin");

    manager.shutdown().await;
}

#[tokio::test]
async fn disconnect_stays_down() {
    let (listener, url) = bind().await;
    let manager = LinkManager::new(fast_config(), TestHandler::new(&url));
    let mut status = manager.subscribe_status();

    manager.connect().await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let _ws = accept_async(socket).await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    manager.disconnect().await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Disconnected)
        .await
        .unwrap();

    // No reconnection attempt arrives
    let accepted = timeout(Duration::from_millis(200), listener.accept()).await;
    assert!(accepted.is_err(), "link reconnected after a local disconnect");
    assert_eq!(manager.status(), LinkStatus::Disconnected);

    // A fresh connect works without rebuilding the manager
    manager.connect().await.unwrap();
    let (socket, _) = listener.accept().await.unwrap();
    let _ws = accept_async(socket).await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    manager.shutdown().await;
}

#[tokio::test]
async fn silent_server_trips_the_heartbeat() {
    let (listener, url) = bind().await;

    let config = LinkConfig::builder()
        .connection(ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        })
        .backoff(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: false,
        })
        .heartbeat(HeartbeatConfig {
            enabled: true,
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(80),
            failure_threshold: 1,
        })
        .build()
        .unwrap();

    let manager = LinkManager::new(config, TestHandler::new(&url));
    let mut status = manager.subscribe_status();

    manager.connect().await.unwrap();

    // Accept the handshake, then never read; pings go unanswered
    let (socket, _) = listener.accept().await.unwrap();
    let _ws = accept_async(socket).await.unwrap();
    status
        .wait_for(|s| *s == LinkStatus::Connected)
        .await
        .unwrap();

    timeout(
        Duration::from_secs(5),
        status.wait_for(|s| matches!(s, LinkStatus::Reconnecting { .. })),
    )
    .await
    .expect("heartbeat tore the link down")
    .unwrap();

    let log = manager.context().error_log();
    assert!(log
        .iter()
        .any(|e| e.source == ErrorSource::Socket && e.category == ErrorCategory::Timeout));

    manager.shutdown().await;
}
