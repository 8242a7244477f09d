//! Byte-stream framing
//!
//! Two tunnel layouts are supported.
//!
//! Raw mode is a bare Annex-B stream. A unit is only known to be complete
//! once the next start code arrives:
//!
//! ```text
//! 00 00 00 01 67 .. | 00 00 00 01 68 .. | 00 00 00 01 65 .. | ...
//! ```
//!
//! Framed mode prefixes every encoder packet with a 12-byte header, so a
//! packet is complete as soon as its payload is buffered:
//!
//! ```text
//! +-----------------------------+---------------+----------------------+
//! | pts + flags (u64, BE)       | length (u32)  | Annex-B packet ...   |
//! +-----------------------------+---------------+----------------------+
//!   bit 63: config packet (SPS/PPS)
//!   bit 62: key frame
//!   bits 0-61: pts in microseconds
//! ```

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};

use crate::error::IngestError;
use crate::media::h264::{find_start_code, split_annex_b, start_code_len, NalUnit};

/// Size of the framed-mode packet header
pub const PACKET_HEADER_SIZE: usize = 12;

const FLAG_CONFIG: u64 = 1 << 63;
const FLAG_KEY_FRAME: u64 = 1 << 62;
const PTS_MASK: u64 = FLAG_KEY_FRAME - 1;

/// Framed-mode packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub pts: Option<u64>,
    pub key_frame: bool,
    pub len: usize,
}

impl PacketHeader {
    pub fn parse(mut data: &[u8]) -> Self {
        let pts_flags = data.get_u64();
        let len = data.get_u32() as usize;

        Self {
            pts: if pts_flags & FLAG_CONFIG != 0 {
                None
            } else {
                Some(pts_flags & PTS_MASK)
            },
            key_frame: pts_flags & FLAG_KEY_FRAME != 0,
            len,
        }
    }

    /// Encode a header (used by tests and tooling that replay captures)
    pub fn encode(pts: Option<u64>, key_frame: bool, len: u32) -> [u8; PACKET_HEADER_SIZE] {
        let mut pts_flags = pts.map_or(FLAG_CONFIG, |pts| pts & PTS_MASK);
        if key_frame {
            pts_flags |= FLAG_KEY_FRAME;
        }
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[..8].copy_from_slice(&pts_flags.to_be_bytes());
        buf[8..].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Framing state for one tunnel
#[derive(Debug)]
pub(crate) enum Framer {
    AnnexB(AnnexBFramer),
    Packet(PacketFramer),
}

impl Framer {
    pub(crate) fn next_unit(&mut self, buf: &mut BytesMut) -> Result<Option<NalUnit>, IngestError> {
        match self {
            Framer::AnnexB(f) => f.next_unit(buf),
            Framer::Packet(f) => f.next_unit(buf),
        }
    }

    /// Whether a unit is buffered that only its successor would complete
    pub(crate) fn has_pending(&self, buf: &BytesMut) -> bool {
        match self {
            Framer::AnnexB(f) => f.has_pending(buf),
            Framer::Packet(_) => false,
        }
    }

    /// Emit the buffered unit without waiting for its successor
    pub(crate) fn flush_pending(&mut self, buf: &mut BytesMut) -> Option<NalUnit> {
        match self {
            Framer::AnnexB(f) => f.flush(buf),
            Framer::Packet(_) => None,
        }
    }
}

/// Start-code delimited framing
#[derive(Debug)]
pub(crate) struct AnnexBFramer {
    max_unit_size: usize,
    /// Whether the buffer is aligned on a start code
    aligned: bool,
    /// Where to resume scanning for the next start code
    scan_from: usize,
}

impl AnnexBFramer {
    pub(crate) fn new(max_unit_size: usize) -> Self {
        Self {
            max_unit_size,
            aligned: false,
            scan_from: 0,
        }
    }

    fn align(&mut self, buf: &mut BytesMut) -> Result<bool, IngestError> {
        match find_start_code(buf, 0) {
            Some((pos, _)) => {
                if buf[..pos].iter().any(|&b| b != 0) {
                    return Err(IngestError::FramingError(format!(
                        "{pos} bytes before the first start code"
                    )));
                }
                buf.advance(pos);
                self.aligned = true;
                Ok(true)
            }
            None => {
                if buf.iter().any(|&b| b != 0) {
                    return Err(IngestError::FramingError(
                        "stream does not begin with a start code".into(),
                    ));
                }
                if buf.len() > self.max_unit_size {
                    return Err(IngestError::FramingError(format!(
                        "no start code within {} bytes",
                        self.max_unit_size
                    )));
                }
                Ok(false)
            }
        }
    }

    fn has_pending(&self, buf: &BytesMut) -> bool {
        self.aligned && start_code_len(buf).is_some_and(|code_len| buf.len() > code_len)
    }

    /// Treat everything buffered as one complete unit
    ///
    /// The next bytes must begin with a start code again.
    fn flush(&mut self, buf: &mut BytesMut) -> Option<NalUnit> {
        if !self.has_pending(buf) {
            return None;
        }
        let data = buf.split().freeze();
        self.aligned = false;
        self.scan_from = 0;
        NalUnit::new(data, None)
    }

    fn next_unit(&mut self, buf: &mut BytesMut) -> Result<Option<NalUnit>, IngestError> {
        loop {
            if !self.aligned && !self.align(buf)? {
                return Ok(None);
            }

            let Some(code_len) = start_code_len(buf) else {
                // Aligned but the start code is not fully buffered yet
                return Ok(None);
            };

            let from = self.scan_from.max(code_len);
            match find_start_code(buf, from) {
                Some((pos, _)) if pos == code_len => {
                    // Two start codes back to back: drop the empty unit
                    buf.advance(code_len);
                    self.scan_from = 0;
                }
                Some((pos, _)) => {
                    let data = buf.split_to(pos).freeze();
                    self.scan_from = 0;
                    if let Some(unit) = NalUnit::new(data, None) {
                        return Ok(Some(unit));
                    }
                }
                None => {
                    if buf.len() > self.max_unit_size {
                        return Err(IngestError::FramingError(format!(
                            "no unit boundary within {} bytes",
                            self.max_unit_size
                        )));
                    }
                    // Keep the last bytes: they may be the start of a start code
                    self.scan_from = buf.len().saturating_sub(3).max(code_len);
                    return Ok(None);
                }
            }
        }
    }
}

/// Packet-header framing
#[derive(Debug)]
pub(crate) struct PacketFramer {
    max_unit_size: usize,
    header: Option<PacketHeader>,
    pending: VecDeque<NalUnit>,
}

impl PacketFramer {
    pub(crate) fn new(max_unit_size: usize) -> Self {
        Self {
            max_unit_size,
            header: None,
            pending: VecDeque::new(),
        }
    }

    fn next_unit(&mut self, buf: &mut BytesMut) -> Result<Option<NalUnit>, IngestError> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Ok(Some(unit));
            }

            let header = match self.header {
                Some(header) => header,
                None => {
                    if buf.len() < PACKET_HEADER_SIZE {
                        return Ok(None);
                    }
                    let header = PacketHeader::parse(&buf[..PACKET_HEADER_SIZE]);
                    if header.len == 0 || header.len > self.max_unit_size {
                        return Err(IngestError::FramingError(format!(
                            "packet length {} outside 1..={}",
                            header.len, self.max_unit_size
                        )));
                    }
                    buf.advance(PACKET_HEADER_SIZE);
                    self.header = Some(header);
                    header
                }
            };

            if buf.len() < header.len {
                return Ok(None);
            }
            self.header = None;

            let packet = buf.split_to(header.len).freeze();
            let parts = split_annex_b(&packet).ok_or_else(|| {
                IngestError::FramingError("packet does not begin with a start code".into())
            })?;
            self.pending.extend(
                parts
                    .into_iter()
                    .filter_map(|data| NalUnit::new(data, header.pts)),
            );
        }
    }
}
