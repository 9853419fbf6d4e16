//! Transport primitive consumed by [`WsClient`](crate::client::WsClient).
//!
//! A [`Transport`] opens a URL and hands back a sink/stream pair of
//! [`Frame`]s. [`TungsteniteTransport`] is the production implementation;
//! tests plug in an in-memory one.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::StreamError;

/// Sink half of a WebSocket connection, used to send messages.
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Stream half of a WebSocket connection, used to receive messages.
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// One message on the wire, independent of the transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close with an optional reason.
    Close(Option<String>),
}

impl Frame {
    /// Text frame carrying `value` serialized as JSON.
    pub fn json(value: &serde_json::Value) -> Self {
        Frame::Text(value.to_string())
    }

    /// Text payload, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<Message> for Frame {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(frame) => Frame::Close(frame.map(|f| f.reason.into_owned())),
            // Raw frames are never yielded when reading.
            Message::Frame(_) => Frame::Binary(Vec::new()),
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
                code: CloseCode::Normal,
                reason: reason.into(),
            })),
        }
    }
}

/// Writing half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: Frame) -> Result<(), StreamError>;

    /// Close the connection. Idempotent.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Reading half of an open connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame; `None` once the connection has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>>;
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open `url` and return its sink/stream pair.
    async fn open(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), StreamError>;
}

/// WebSocket transport over `tokio-tungstenite` (rustls).
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, url: &str) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), StreamError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StreamError::network(url, format!("connection failed: {e}")))?;
        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(TungsteniteSink {
                url: url.to_string(),
                sink,
            }),
            Box::new(TungsteniteStream {
                url: url.to_string(),
                stream,
            }),
        ))
    }
}

struct TungsteniteSink {
    url: String,
    sink: WsSink,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: Frame) -> Result<(), StreamError> {
        self.sink
            .send(Message::from(frame))
            .await
            .map_err(|e| StreamError::network(&self.url, format!("send failed: {e}")))
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.sink
            .close()
            .await
            .map_err(|e| StreamError::network(&self.url, format!("close failed: {e}")))
    }
}

struct TungsteniteStream {
    url: String,
    stream: WsStream,
}

#[async_trait]
impl FrameStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        let next = self.stream.next().await?;
        Some(
            next.map(Frame::from)
                .map_err(|e| StreamError::network(&self.url, format!("WebSocket read error: {e}"))),
        )
    }
}
