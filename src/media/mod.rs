//! Media handling for the capture stream
//!
//! This module provides:
//! - H.264 Annex-B unit framing helpers and classification
//! - SPS parsing for the encoded picture size
//! - Parameter-set caching for late-joiner support

pub mod cache;
pub mod h264;
pub mod sps;

pub use cache::{ParameterBundle, ParameterCache};
pub use h264::{NalUnit, NaluType, UnitKind};
pub use sps::Sps;
