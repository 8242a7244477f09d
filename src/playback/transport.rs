//! Consumer transport
//!
//! [`Connector`] opens a connection to the relay; [`Connection`] yields what
//! arrives on it. [`WsConnector`] is the WebSocket implementation.

use std::future::Future;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::device::StreamInfo;
use crate::error::ConnectError;
use crate::server::message::{stream_info, IncomingText, RelayMessage};

/// Something received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// One Annex-B NAL unit
    Unit(Bytes),
    /// Device and stream resolution
    Metadata(StreamInfo),
    /// The relay cannot serve this stream
    Error(String),
}

/// Opens connections to the relay
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, ConnectError>> + Send;
}

/// An open connection
pub trait Connection: Send + 'static {
    /// Next message; `None` once the connection is closed
    fn recv(&mut self) -> impl Future<Output = Option<Result<Incoming, ConnectError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket connector for `ws://HOST:PORT/video/{device_id}`
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connector for a device on a relay at `host:port`
    pub fn for_device(relay: &str, device: &str) -> Self {
        let mut encoded = String::with_capacity(device.len());
        for b in device.bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                encoded.push(b as char);
            } else {
                encoded.push_str(&format!("%{b:02X}"));
            }
        }
        Self::new(format!("ws://{relay}/video/{encoded}"))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self) -> Result<WsConnection, ConnectError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        tracing::debug!(url = %self.url, "Connected to relay");
        Ok(WsConnection { stream })
    }
}

/// WebSocket connection to the relay
pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<Incoming, ConnectError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(e.into())),
            };
            match msg {
                Message::Binary(data) => return Some(Ok(Incoming::Unit(data))),
                Message::Text(text) => return Some(parse_text(text.as_str())),
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn parse_text(text: &str) -> Result<Incoming, ConnectError> {
    Ok(match IncomingText::parse(text)? {
        IncomingText::Tagged(RelayMessage::Metadata {
            device_width,
            device_height,
            stream_width,
            stream_height,
        }) => Incoming::Metadata(stream_info(
            device_width,
            device_height,
            stream_width,
            stream_height,
        )),
        IncomingText::Tagged(RelayMessage::Error { error }) | IncomingText::BareError { error } => {
            Incoming::Error(error)
        }
    })
}
