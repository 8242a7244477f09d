//! Consumer-side playback
//!
//! A [`PlaybackClient`] connects to the relay, feeds units to a decoder and
//! decides when to resync, reconnect or give up. The decisions live in the
//! pure [`PlaybackMachine`]; the client only performs its effects.

pub mod client;
pub mod config;
pub mod decoder;
pub mod machine;
pub mod transport;

pub use client::{PlaybackClient, PlaybackOutcome, PlaybackStatus};
pub use config::PlaybackConfig;
pub use decoder::{Decoder, DecoderFactory, ElementaryStreamSink, SinkFactory};
pub use machine::{
    Effect, FallbackReason, PlaybackEvent, PlaybackMachine, PlaybackState, TimerKind,
};
pub use transport::{Connection, Connector, Incoming, WsConnection, WsConnector};
