//! Events delivered to consumers
//!
//! Units are cheap to clone: every consumer queue shares the same `Bytes`
//! allocation.

use crate::device::StreamInfo;
use crate::media::h264::NalUnit;

/// One item in a consumer queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Resolution report; always the first event and re-sent on change
    Info(StreamInfo),
    /// One Annex-B NAL unit
    Unit(NalUnit),
    /// Ingestion stopped; no more events follow
    Ended(String),
}

impl StreamEvent {
    pub fn is_unit(&self) -> bool {
        matches!(self, StreamEvent::Unit(_))
    }

    /// The unit, if this is one
    pub fn unit(&self) -> Option<&NalUnit> {
        match self {
            StreamEvent::Unit(unit) => Some(unit),
            _ => None,
        }
    }
}
