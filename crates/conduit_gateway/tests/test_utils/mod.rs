//! In-memory gateway for session tests.
//!
//! [`MockConnector`] hands every connection it opens to the test as a
//! [`ServerConnection`], which plays the server side of the protocol.

#![allow(dead_code)]

use async_trait::async_trait;
use conduit_core::{Credentials, GatewayConfig, intents};
use conduit_error::{GatewayError, GatewayErrorKind, GatewayResult};
use conduit_gateway::{
    Connection, Connector, GatewaySink, GatewayStream, LifecycleEvent, SessionPhase,
    StreamingSession, WireMessage,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Upper bound on any single wait. Tests run with paused time, so this only
/// trips when a test would otherwise hang.
pub const WAIT: Duration = Duration::from_secs(600);

/// Connector whose connections are driven by the test.
#[derive(Debug)]
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerConnection>,
    urls: Mutex<Vec<String>>,
    refuse: AtomicU32,
}

impl MockConnector {
    /// Every URL connected to, in order.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Fail the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> GatewayResult<Connection> {
        self.urls.lock().push(url.to_string());
        if self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::new(GatewayErrorKind::Transport(
                "connection refused".to_string(),
            )));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerConnection {
                url: url.to_string(),
                inbound: from_client,
                outbound: Some(to_client),
            })
            .map_err(|_| {
                GatewayError::new(GatewayErrorKind::Transport("gateway gone".to_string()))
            })?;

        Ok(Connection {
            sink: Box::new(MockSink {
                tx: to_server,
                closed: false,
            }),
            stream: Box::new(MockStream { rx: from_server }),
        })
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<WireMessage>,
    closed: bool,
}

#[async_trait]
impl GatewaySink for MockSink {
    async fn send(&mut self, message: WireMessage) -> GatewayResult<()> {
        if self.closed {
            return Err(GatewayError::new(GatewayErrorKind::Transport(
                "sink closed".to_string(),
            )));
        }
        self.tx
            .send(message)
            .map_err(|_| GatewayError::new(GatewayErrorKind::Transport("peer gone".to_string())))
    }

    async fn close(&mut self, code: u16, reason: &str) -> GatewayResult<()> {
        self.closed = true;
        self.tx
            .send(WireMessage::Close {
                code: Some(code),
                reason: reason.to_string(),
            })
            .map_err(|_| GatewayError::new(GatewayErrorKind::Transport("peer gone".to_string())))
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<GatewayResult<WireMessage>>,
}

#[async_trait]
impl GatewayStream for MockStream {
    async fn next(&mut self) -> Option<GatewayResult<WireMessage>> {
        self.rx.recv().await
    }
}

/// Test side of the connector.
pub struct MockGateway {
    accepted: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MockGateway {
    /// Wait for the next connection attempt.
    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("connection attempt before timeout")
            .expect("connector alive")
    }

    /// A connection attempt, if one is already waiting.
    pub fn try_accept(&mut self) -> Option<ServerConnection> {
        self.accepted.try_recv().ok()
    }
}

/// Connector plus the handle that accepts its connections.
pub fn mock_gateway() -> (Arc<MockConnector>, MockGateway) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MockConnector {
            accepted: tx,
            urls: Mutex::new(Vec::new()),
            refuse: AtomicU32::new(0),
        }),
        MockGateway { accepted: rx },
    )
}

/// Server side of one connection.
pub struct ServerConnection {
    /// URL the client connected to
    pub url: String,
    inbound: mpsc::UnboundedReceiver<WireMessage>,
    outbound: Option<mpsc::UnboundedSender<GatewayResult<WireMessage>>>,
}

impl ServerConnection {
    /// Send a raw message to the client.
    pub fn send_message(&self, message: WireMessage) {
        if let Some(outbound) = &self.outbound {
            let _ = outbound.send(Ok(message));
        }
    }

    /// Send a JSON text frame.
    pub fn send(&self, value: Value) {
        self.send_message(WireMessage::Text(value.to_string()));
    }

    /// op 10
    pub fn hello(&self, heartbeat_interval: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval}, "s": null, "t": null}));
    }

    /// READY with a resume URL.
    pub fn ready(&self, session_id: &str, seq: u64) {
        self.dispatch(
            "READY",
            seq,
            json!({
                "v": 10,
                "session_id": session_id,
                "resume_gateway_url": "wss://resume.test",
                "user": {"id": "1", "username": "conduit"},
                "guilds": [],
            }),
        );
    }

    /// RESUMED
    pub fn resumed(&self, seq: u64) {
        self.dispatch("RESUMED", seq, Value::Null);
    }

    /// op 0
    pub fn dispatch(&self, event: &str, seq: u64, data: Value) {
        self.send(json!({"op": 0, "s": seq, "t": event, "d": data}));
    }

    /// op 11
    pub fn ack(&self) {
        self.send(json!({"op": 11}));
    }

    /// op 1
    pub fn request_heartbeat(&self) {
        self.send(json!({"op": 1, "d": null}));
    }

    /// op 7
    pub fn reconnect(&self) {
        self.send(json!({"op": 7, "d": null}));
    }

    /// op 9
    pub fn invalid_session(&self, resumable: bool) {
        self.send(json!({"op": 9, "d": resumable}));
    }

    /// Close with `code` and hang up.
    pub fn close(&mut self, code: u16, reason: &str) {
        self.send_message(WireMessage::Close {
            code: Some(code),
            reason: reason.to_string(),
        });
        self.outbound = None;
    }

    /// Hang up without a close frame.
    pub fn drop_connection(&mut self) {
        self.outbound = None;
    }

    /// Stop reading from the client, so its sends fail while the stream stays open.
    pub fn stop_reading(&mut self) {
        let (_, closed) = mpsc::unbounded_channel();
        self.inbound = closed;
    }

    /// Next message from the client, `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        tokio::time::timeout(WAIT, self.inbound.recv())
            .await
            .expect("client message before timeout")
    }

    /// Next JSON payload from the client.
    pub async fn recv_payload(&mut self) -> Value {
        match self.recv().await {
            Some(WireMessage::Text(text)) => serde_json::from_str(&text).expect("client sends JSON"),
            other => panic!("expected a payload, got {:?}", other),
        }
    }

    /// Next payload with opcode `op`, skipping heartbeats unless `op` is 1.
    pub async fn expect_op(&mut self, op: u64) -> Value {
        loop {
            let payload = self.recv_payload().await;
            if payload["op"] == op {
                return payload;
            }
            assert_eq!(payload["op"], 1, "unexpected payload {}", payload);
        }
    }

    /// Wait for the client's close frame, skipping payloads.
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            match self.recv().await {
                Some(WireMessage::Close { code, .. }) => return code,
                Some(_) => continue,
                None => panic!("client hung up without a close frame"),
            }
        }
    }
}

/// Gateway config tuned for paused-time tests.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        url: "wss://gateway.test".to_string(),
        heartbeat_jitter: false,
        hello_timeout_ms: 5_000,
        connect_timeout_ms: 60_000,
        identify_interval_ms: 100,
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 1_000,
        invalid_session_delay_ms: 50,
        ..GatewayConfig::default()
    }
}

/// Credentials used by every test.
pub fn credentials() -> Credentials {
    Credentials::new("test-token", intents::GUILDS | intents::GUILD_MESSAGES)
}

/// Connect `session` against `gateway`, completing the identify handshake.
pub async fn connect_ready(
    session: &StreamingSession,
    gateway: &mut MockGateway,
    session_id: &str,
    heartbeat_interval: u64,
) -> ServerConnection {
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(&credentials()).await })
    };
    let mut conn = gateway.accept().await;
    conn.hello(heartbeat_interval);
    conn.expect_op(2).await;
    conn.ready(session_id, 1);
    connecting
        .await
        .expect("connect task")
        .expect("session connects");
    conn
}

/// Next lifecycle event.
pub async fn next_lifecycle(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("lifecycle event before timeout")
        .expect("lifecycle channel open")
}

/// Poll until `session` reaches `phase`.
pub async fn wait_for_phase(session: &StreamingSession, phase: SessionPhase) {
    tokio::time::timeout(WAIT, async {
        while session.phase() != phase {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("phase reached before timeout");
}
