//! In-memory REST API and a gateway that completes handshakes by itself.

#![allow(dead_code)]

use async_trait::async_trait;
use conduit_core::{ConduitConfig, Credentials, GatewayConfig, RestConfig, intents};
use conduit_error::{GatewayError, GatewayErrorKind, GatewayResult, HttpError};
use conduit_gateway::{Connection, Connector, GatewaySink, GatewayStream, WireMessage};
use conduit_http::{HttpRequest, HttpResponse, HttpTransport};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;

/// REST API that answers `GET /gateway/bot` with a fixed body.
#[derive(Debug)]
pub struct MockApi {
    gateway_bot: Value,
    requests: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn new(shards: u32, max_concurrency: u32) -> Arc<Self> {
        Arc::new(Self {
            gateway_bot: json!({
                "url": "wss://recommended.test",
                "shards": shards,
                "session_start_limit": {
                    "total": 1000,
                    "remaining": 998,
                    "reset_after": 3_600_000,
                    "max_concurrency": max_concurrency,
                },
            }),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// URLs requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for MockApi {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests.lock().push(request.url().clone());
        if request.url().ends_with("/gateway/bot") {
            Ok(HttpResponse::new(
                200,
                Vec::new(),
                self.gateway_bot.to_string().into_bytes(),
            ))
        } else {
            Ok(HttpResponse::new(
                404,
                Vec::new(),
                br#"{"code": 0, "message": "404: Not Found"}"#.to_vec(),
            ))
        }
    }
}

/// Gateway that sends Hello, answers Identify with READY and acks heartbeats.
#[derive(Debug, Default)]
pub struct AutoGateway {
    urls: Mutex<Vec<String>>,
    identifies: Arc<Mutex<Vec<Value>>>,
}

impl AutoGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every URL connected to, in order.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }

    /// Identify payloads received, in order.
    pub fn identifies(&self) -> Vec<Value> {
        self.identifies.lock().clone()
    }
}

#[async_trait]
impl Connector for AutoGateway {
    async fn connect(&self, url: &str) -> GatewayResult<Connection> {
        self.urls.lock().push(url.to_string());
        let (to_server, mut from_client) = mpsc::unbounded_channel::<WireMessage>();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let identifies = Arc::clone(&self.identifies);

        tokio::spawn(async move {
            let send = |value: Value| {
                let _ = to_client.send(Ok(WireMessage::Text(value.to_string())));
            };
            send(json!({"op": 10, "d": {"heartbeat_interval": 45_000}}));
            while let Some(message) = from_client.recv().await {
                let WireMessage::Text(text) = message else {
                    break;
                };
                let payload: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                match payload["op"].as_u64() {
                    Some(1) => send(json!({"op": 11})),
                    Some(2) => {
                        let shard = payload["d"]["shard"][0].as_u64().unwrap_or(0);
                        identifies.lock().push(payload);
                        send(json!({
                            "op": 0,
                            "s": 1,
                            "t": "READY",
                            "d": {
                                "session_id": format!("session-{}", shard),
                                "resume_gateway_url": "wss://resume.test",
                            },
                        }));
                        send(json!({
                            "op": 0,
                            "s": 2,
                            "t": "GUILD_CREATE",
                            "d": {"id": shard.to_string()},
                        }));
                    }
                    _ => {}
                }
            }
        });

        Ok(Connection {
            sink: Box::new(ChannelSink { tx: to_server }),
            stream: Box::new(ChannelStream { rx: from_server }),
        })
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<WireMessage>,
}

#[async_trait]
impl GatewaySink for ChannelSink {
    async fn send(&mut self, message: WireMessage) -> GatewayResult<()> {
        self.tx
            .send(message)
            .map_err(|_| GatewayError::new(GatewayErrorKind::Transport("peer gone".to_string())))
    }

    async fn close(&mut self, code: u16, reason: &str) -> GatewayResult<()> {
        self.send(WireMessage::Close {
            code: Some(code),
            reason: reason.to_string(),
        })
        .await
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<GatewayResult<WireMessage>>,
}

#[async_trait]
impl GatewayStream for ChannelStream {
    async fn next(&mut self) -> Option<GatewayResult<WireMessage>> {
        self.rx.recv().await
    }
}

/// Client config tuned for paused-time tests.
pub fn test_config(shard_count: u32) -> ConduitConfig {
    ConduitConfig {
        rest: RestConfig {
            api_base: "https://api.test/v10".to_string(),
            ..RestConfig::default()
        },
        gateway: GatewayConfig {
            url: "wss://configured.test".to_string(),
            shard_count,
            heartbeat_jitter: false,
            identify_interval_ms: 5_000,
            ..GatewayConfig::default()
        },
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("test-token", intents::GUILDS)
}
