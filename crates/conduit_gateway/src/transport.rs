//! WebSocket transport seam.
//!
//! The session only talks to [`Connector`], [`GatewaySink`] and
//! [`GatewayStream`]; [`TungsteniteConnector`] is the production
//! implementation.

use async_trait::async_trait;
use conduit_error::{GatewayError, GatewayErrorKind, GatewayResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument};

/// A data or close message, with pings and pongs already handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame (zlib-stream chunks)
    Binary(Vec<u8>),
    /// Close frame
    Close {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
}

/// Opens gateway connections.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Connect to `url`.
    async fn connect(&self, url: &str) -> GatewayResult<Connection>;
}

/// Write half of a connection.
#[async_trait]
pub trait GatewaySink: Send {
    /// Send one message.
    async fn send(&mut self, message: WireMessage) -> GatewayResult<()>;

    /// Send a close frame and shut the write half.
    async fn close(&mut self, code: u16, reason: &str) -> GatewayResult<()>;
}

/// Read half of a connection.
#[async_trait]
pub trait GatewayStream: Send {
    /// Next message; `None` once the connection is gone.
    async fn next(&mut self) -> Option<GatewayResult<WireMessage>>;
}

/// An open connection, split into halves.
pub struct Connection {
    /// Write half
    pub sink: Box<dyn GatewaySink>,
    /// Read half
    pub stream: Box<dyn GatewayStream>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

fn transport_error(e: impl std::fmt::Display) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Transport(e.to_string()))
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    #[instrument(skip(self))]
    async fn connect(&self, url: &str) -> GatewayResult<Connection> {
        let (ws, response) = connect_async(url).await.map_err(transport_error)?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        let (sink, stream) = ws.split();
        Ok(Connection {
            sink: Box::new(TungsteniteSink(sink)),
            stream: Box::new(TungsteniteStream(stream)),
        })
    }
}

struct TungsteniteSink(SplitSink<WsStream, Message>);

#[async_trait]
impl GatewaySink for TungsteniteSink {
    async fn send(&mut self, message: WireMessage) -> GatewayResult<()> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(data) => Message::Binary(data.into()),
            WireMessage::Close { code, reason } => Message::Close(code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.0.send(message).await.map_err(transport_error)
    }

    async fn close(&mut self, code: u16, reason: &str) -> GatewayResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(transport_error)?;
        self.0.close().await.map_err(transport_error)
    }
}

struct TungsteniteStream(SplitStream<WsStream>);

#[async_trait]
impl GatewayStream for TungsteniteStream {
    async fn next(&mut self) -> Option<GatewayResult<WireMessage>> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(transport_error(e))),
            };
            return Some(Ok(match message {
                Message::Text(text) => WireMessage::Text(text.to_string()),
                Message::Binary(data) => WireMessage::Binary(data.to_vec()),
                Message::Close(frame) => WireMessage::Close {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                },
                // tungstenite queues the pong itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }));
        }
    }
}
