//! Per-consumer WebSocket connection
//!
//! ```text
//! GET /video/{device_id}  (upgrade)
//!   -> registry.attach(device)
//!   -> loop: queue event -> text (metadata/error) or binary (one NAL unit)
//!   -> registry.detach(device, consumer)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::config::ServerConfig;
use super::listener::ServerCounters;
use super::message::RelayMessage;
use crate::capture::CaptureLauncher;
use crate::device::DeviceId;
use crate::error::Result;
use crate::registry::{SessionRegistry, StreamEvent, Subscription};

/// Path prefix of the video endpoint
pub const VIDEO_PATH_PREFIX: &str = "/video/";

/// Extract the device id from a request path
///
/// Accepts `/video/{device_id}`; the id may be percent-encoded (device ids
/// such as `192.168.1.20:5555` often are).
pub fn device_from_path(path: &str) -> Option<DeviceId> {
    let raw = path.strip_prefix(VIDEO_PATH_PREFIX)?;
    let raw = raw.strip_suffix('/').unwrap_or(raw);
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    let decoded = percent_decode(raw)?;
    if decoded.is_empty() {
        return None;
    }
    Some(DeviceId::new(decoded))
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("expected /video/{device_id}".into()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// One consumer connection
pub(crate) struct Connection<L> {
    id: u64,
    peer: SocketAddr,
    config: ServerConfig,
    registry: Arc<SessionRegistry<L>>,
    counters: Arc<ServerCounters>,
}

impl<L: CaptureLauncher> Connection<L> {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        config: ServerConfig,
        registry: Arc<SessionRegistry<L>>,
        counters: Arc<ServerCounters>,
    ) -> Self {
        Self {
            id,
            peer,
            config,
            registry,
            counters,
        }
    }

    pub(crate) async fn run(self, socket: TcpStream) -> Result<()> {
        let mut requested = None;
        let callback = |req: &Request, response: Response| match device_from_path(req.uri().path()) {
            Some(device) => {
                requested = Some(device);
                Ok(response)
            }
            None => Err(not_found()),
        };

        let ws = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::accept_hdr_async(socket, callback),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "websocket handshake timed out")
        })??;

        let Some(device) = requested else {
            return Ok(());
        };

        tracing::info!(
            connection_id = self.id,
            peer = %self.peer,
            device = %device,
            "Video consumer connected"
        );

        let (mut sink, mut incoming) = ws.split();

        let mut subscription = match self.registry.attach(&device).await {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(connection_id = self.id, device = %device, error = %e, "Attach failed");
                send_error(&mut sink, e.to_string()).await?;
                let _ = sink.close().await;
                return Ok(());
            }
        };

        let result = self
            .pump(&mut subscription, &mut sink, &mut incoming)
            .await;
        self.registry.detach(&device, subscription.id()).await;

        tracing::info!(
            connection_id = self.id,
            device = %device,
            consumer = subscription.id(),
            "Video consumer disconnected"
        );
        result
    }

    async fn pump<S>(
        &self,
        subscription: &mut Subscription,
        sink: &mut S,
        incoming: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) -> Result<()>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(StreamEvent::Unit(unit)) => {
                        // Shares the unit's allocation with every other consumer
                        sink.send(Message::Binary(unit.data().clone())).await?;
                        self.counters.units_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(StreamEvent::Info(info)) => {
                        let json = RelayMessage::metadata(info).to_json()?;
                        sink.send(Message::Text(json.into())).await?;
                    }
                    Some(StreamEvent::Ended(reason)) => {
                        send_error(sink, reason).await?;
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    None => {
                        // Detached by the session: slow consumer or teardown
                        send_error(sink, "stream closed").await?;
                        let _ = sink.close().await;
                        return Ok(());
                    }
                },
                msg = incoming.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    // Pings are answered by tungstenite; nothing else is expected
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

async fn send_error<S>(sink: &mut S, error: impl ToString) -> Result<()>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = RelayMessage::error(error).to_json()?;
    sink.send(Message::Text(json.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_from_path() {
        assert_eq!(
            device_from_path("/video/emulator-5554"),
            Some(DeviceId::from("emulator-5554"))
        );
        assert_eq!(
            device_from_path("/video/192.168.1.20%3A5555"),
            Some(DeviceId::from("192.168.1.20:5555"))
        );
        assert_eq!(
            device_from_path("/video/192.168.1.20:5555/"),
            Some(DeviceId::from("192.168.1.20:5555"))
        );
    }

    #[test]
    fn test_device_from_path_rejects() {
        assert_eq!(device_from_path("/video/"), None);
        assert_eq!(device_from_path("/video"), None);
        assert_eq!(device_from_path("/audio/abc"), None);
        assert_eq!(device_from_path("/video/a/b"), None);
        assert_eq!(device_from_path("/video/bad%zz"), None);
        assert_eq!(device_from_path("/video/%4"), None);
    }
}
