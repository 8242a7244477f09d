//! Tunnel ingestion
//!
//! [`StreamIngester`] reads the capture tunnel and yields complete NAL units
//! in arrival order. Units are never reordered, merged or dropped. Any
//! framing violation or end of stream is terminal: the ingester reports the
//! error and keeps reporting it on every later call.

pub mod framer;

use std::time::Duration;

use bytes::BytesMut;
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::IngestError;
use crate::media::h264::NalUnit;

use framer::{AnnexBFramer, Framer, PacketFramer};

pub use framer::{PacketHeader, PACKET_HEADER_SIZE};

/// Default upper bound for a single unit (8 MiB)
pub const DEFAULT_MAX_UNIT_SIZE: usize = 8 * 1024 * 1024;

/// Default idle time after which raw mode emits the buffered unit
pub const DEFAULT_IDLE_FLUSH: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 64 * 1024;

/// Layout of the bytes on the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelMode {
    /// Bare Annex-B byte stream
    Raw,
    /// 12-byte packet header before every encoder packet
    #[default]
    Framed,
}

/// Turns a tunnel byte stream into NAL units
pub struct StreamIngester<R> {
    reader: R,
    buf: BytesMut,
    framer: Framer,
    failed: Option<IngestError>,
    idle_flush: Option<Duration>,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> StreamIngester<R> {
    pub fn new(reader: R, mode: TunnelMode, max_unit_size: usize) -> Self {
        let framer = match mode {
            TunnelMode::Raw => Framer::AnnexB(AnnexBFramer::new(max_unit_size)),
            TunnelMode::Framed => Framer::Packet(PacketFramer::new(max_unit_size)),
        };

        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            framer,
            failed: None,
            idle_flush: None,
            bytes_read: 0,
        }
    }

    /// Raw mode: emit a buffered unit once the tunnel has been idle this long
    ///
    /// The helper only encodes when the screen changes, so on a static
    /// screen the last unit would otherwise wait for the next frame. A unit
    /// split across an idle gap ends the stream with a framing error.
    pub fn with_idle_flush(mut self, after: Duration) -> Self {
        self.idle_flush = Some(after);
        self
    }

    /// Read until the next complete unit is available
    ///
    /// In raw mode without an idle flush, a trailing unit that is never
    /// followed by a start code is not emitted: end of stream is reported
    /// instead.
    pub async fn next_unit(&mut self) -> Result<NalUnit, IngestError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        loop {
            match self.framer.next_unit(&mut self.buf) {
                Ok(Some(unit)) => return Ok(unit),
                Ok(None) => {}
                Err(err) => return Err(self.fail(err)),
            }

            self.buf.reserve(READ_CHUNK);
            let flush_after = self.idle_flush.filter(|_| self.framer.has_pending(&self.buf));
            let read = match flush_after {
                Some(after) => {
                    match tokio::time::timeout(after, self.reader.read_buf(&mut self.buf)).await {
                        Ok(read) => read,
                        Err(_) => {
                            if let Some(unit) = self.framer.flush_pending(&mut self.buf) {
                                return Ok(unit);
                            }
                            continue;
                        }
                    }
                }
                None => self.reader.read_buf(&mut self.buf).await,
            };
            match read {
                Ok(0) => {
                    let reason = if self.buf.is_empty() {
                        "end of stream".to_string()
                    } else {
                        format!("end of stream with {} bytes unframed", self.buf.len())
                    };
                    return Err(self.fail(IngestError::StreamEnded(reason)));
                }
                Ok(n) => self.bytes_read += n as u64,
                Err(e) => return Err(self.fail(IngestError::StreamEnded(e.to_string()))),
            }
        }
    }

    fn fail(&mut self, err: IngestError) -> IngestError {
        tracing::debug!(bytes_read = self.bytes_read, error = %err, "Ingest stopped");
        self.failed = Some(err.clone());
        err
    }

    /// Total bytes read from the tunnel
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Whether a terminal error has been reported
    pub fn is_terminated(&self) -> bool {
        self.failed.is_some()
    }

    /// Convert into a stream that ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<NalUnit, IngestError>> {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut ingester = state?;
            match ingester.next_unit().await {
                Ok(unit) => Some((Ok(unit), Some(ingester))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
