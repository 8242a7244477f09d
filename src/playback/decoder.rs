//! Decoder seam for the playback client
//!
//! The client creates a fresh decoder for every connection attempt, so no
//! half-initialized state survives a resync.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::DecodeError;
use crate::media::{NalUnit, UnitKind};

/// Streaming H.264 decoder bound to some output
pub trait Decoder: Send {
    /// Hand one unit to the decoder
    fn feed(&mut self, unit: &NalUnit) -> Result<(), DecodeError>;

    /// Decoded-but-undisplayed media currently buffered
    fn buffered(&self) -> Duration {
        Duration::ZERO
    }
}

/// Creates one decoder per connection attempt
pub trait DecoderFactory: Send + 'static {
    type Decoder: Decoder;

    fn create(&mut self) -> Self::Decoder;
}

/// Units a sink may hold for a writer that is not keeping up
pub const DEFAULT_MAX_PENDING: usize = 512;

/// Writes the elementary stream to any [`Write`], e.g. a pipe into a player
///
/// Validates the decode order a real decoder requires: slices need both
/// parameter sets, inter slices need a preceding intra slice.
///
/// A non-blocking writer may answer `WouldBlock`; the unit then stays
/// pending and [`Decoder::buffered`] reports how long the oldest pending
/// unit has been waiting.
pub struct ElementaryStreamSink<W> {
    out: W,
    has_sps: bool,
    has_pps: bool,
    has_intra: bool,
    pending: VecDeque<(Bytes, Instant)>,
    /// Bytes of the front pending unit already written
    offset: usize,
    max_pending: usize,
    units: u64,
}

impl<W: Write> ElementaryStreamSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            has_sps: false,
            has_pps: false,
            has_intra: false,
            pending: VecDeque::new(),
            offset: 0,
            max_pending: DEFAULT_MAX_PENDING,
            units: 0,
        }
    }

    /// Limit the units held while the writer is blocked
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max.max(1);
        self
    }

    /// Units fully written so far
    pub fn units(&self) -> u64 {
        self.units
    }

    /// Units accepted but not yet taken by the writer
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn drain(&mut self) -> Result<(), DecodeError> {
        while let Some((data, _)) = self.pending.front() {
            match self.out.write(&data[self.offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == data.len() {
                        self.pending.pop_front();
                        self.offset = 0;
                        self.units += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match self.out.flush() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl<W: Write + Send> Decoder for ElementaryStreamSink<W> {
    fn feed(&mut self, unit: &NalUnit) -> Result<(), DecodeError> {
        match unit.kind() {
            UnitKind::ParameterSetA => self.has_sps = true,
            UnitKind::ParameterSetB => self.has_pps = true,
            UnitKind::Intra | UnitKind::Inter if !(self.has_sps && self.has_pps) => {
                return Err(DecodeError::MissingParameterSets);
            }
            UnitKind::Intra => self.has_intra = true,
            UnitKind::Inter if !self.has_intra => return Err(DecodeError::MissingReference),
            UnitKind::Inter | UnitKind::Other => {}
        }

        if self.pending.len() >= self.max_pending {
            return Err(DecodeError::Buffer(format!(
                "{} units waiting for the writer",
                self.pending.len()
            )));
        }
        self.pending.push_back((unit.data().clone(), Instant::now()));
        self.drain()
    }

    fn buffered(&self) -> Duration {
        self.pending
            .front()
            .map(|(_, queued)| queued.elapsed())
            .unwrap_or_default()
    }
}

/// [`DecoderFactory`] producing [`ElementaryStreamSink`]s
pub struct SinkFactory<F> {
    make_writer: F,
}

impl<F> SinkFactory<F> {
    pub fn new(make_writer: F) -> Self {
        Self { make_writer }
    }
}

impl<F, W> DecoderFactory for SinkFactory<F>
where
    F: FnMut() -> W + Send + 'static,
    W: Write + Send,
{
    type Decoder = ElementaryStreamSink<W>;

    fn create(&mut self) -> Self::Decoder {
        ElementaryStreamSink::new((self.make_writer)())
    }
}
