//! Transport abstraction for fabric connections.
//!
//! Both the remote storage adapter and the gateway client talk through the
//! [`MessageTransport`] trait instead of a concrete WebSocket, so tests can
//! substitute a scripted transport. [`TokioTransport`] is the production
//! implementation over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// A message received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping from the peer (answered automatically by the implementation).
    Ping(Vec<u8>),
    /// Pong from the peer.
    Pong(Vec<u8>),
    /// Close frame with the peer's close code, if any.
    Close(Option<u16>),
}

/// Transport-level failures.
#[derive(Debug)]
pub enum TransportError {
    /// Could not open the connection.
    ConnectionFailed(String),
    /// A send failed.
    SendFailed(String),
    /// Anything else.
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionFailed(e) => write!(f, "connection failed: {}", e),
            TransportError::SendFailed(e) => write!(f, "send failed: {}", e),
            TransportError::Other(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

/// One live, message-oriented connection.
#[async_trait]
pub trait MessageTransport: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Receive the next frame. `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Close the connection with an explicit close code.
    async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Factory for [`MessageTransport`] connections.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// The transport this connector produces.
    type Transport: MessageTransport;

    /// Dial a URL.
    async fn connect(&self, url: &str) -> Result<Self::Transport, TransportError>;
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`MessageTransport`] backed by tokio-tungstenite.
pub struct TokioTransport {
    ws: WsStream,
}

impl TokioTransport {
    /// Connect to a WebSocket URL.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { ws })
    }
}

#[async_trait]
impl MessageTransport for TokioTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WsMessage, TransportError>> {
        match self.ws.next().await {
            Some(Ok(Message::Text(text))) => Some(Ok(WsMessage::Text(text.to_string()))),
            Some(Ok(Message::Binary(data))) => Some(Ok(WsMessage::Binary(data.to_vec()))),
            Some(Ok(Message::Ping(data))) => Some(Ok(WsMessage::Ping(data.to_vec()))),
            Some(Ok(Message::Pong(data))) => Some(Ok(WsMessage::Pong(data.to_vec()))),
            Some(Ok(Message::Close(frame))) => {
                Some(Ok(WsMessage::Close(frame.map(|f| f.code.into()))))
            }
            Some(Ok(Message::Frame(_))) => {
                // Raw frames are not expected; skip.
                Some(Ok(WsMessage::Pong(vec![])))
            }
            Some(Err(e)) => Some(Err(TransportError::Other(e.to_string()))),
            None => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.ws
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            }))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Connector producing [`TokioTransport`] connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioConnector;

#[async_trait]
impl TransportConnector for TokioConnector {
    type Transport = TokioTransport;

    async fn connect(&self, url: &str) -> Result<Self::Transport, TransportError> {
        TokioTransport::connect(url).await
    }
}
