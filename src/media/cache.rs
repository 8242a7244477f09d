//! Parameter-set cache for late-joiner support
//!
//! A consumer that joins an existing stream needs, before anything else:
//! 1. The SPS and PPS the encoder is currently using
//! 2. The most recent IDR frame
//!
//! With those three units a decoder can start immediately instead of waiting
//! for the next keyframe. The helper is configured with a short keyframe
//! interval, so keeping only the latest IDR (not a whole GOP) is enough.

use super::h264::{NalUnit, UnitKind};

/// A decodable-from-scratch starting point
///
/// All three units belong to the same encoder configuration (`epoch`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterBundle {
    pub sps: NalUnit,
    pub pps: NalUnit,
    pub intra: NalUnit,
    /// Configuration epoch the parameter sets were captured in
    pub epoch: u64,
}

impl ParameterBundle {
    /// Units in replay order
    pub fn units(&self) -> [&NalUnit; 3] {
        [&self.sps, &self.pps, &self.intra]
    }

    /// Total size in bytes
    pub fn size(&self) -> usize {
        self.sps.len() + self.pps.len() + self.intra.len()
    }
}

/// Holds the latest committed [`ParameterBundle`]
#[derive(Debug, Default)]
pub struct ParameterCache {
    /// SPS waiting for its IDR
    staged_sps: Option<NalUnit>,
    /// PPS waiting for its IDR
    staged_pps: Option<NalUnit>,
    /// Bumped every time the SPS content changes
    epoch: u64,
    /// Last committed bundle
    bundle: Option<ParameterBundle>,
    /// Number of bundles committed so far
    commits: u64,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one ingested unit
    ///
    /// Parameter sets are staged; an IDR with both parameter sets staged
    /// replaces the cached bundle. Returns the new bundle when this unit
    /// committed one.
    pub fn on_unit(&mut self, unit: &NalUnit) -> Option<&ParameterBundle> {
        match unit.kind() {
            UnitKind::ParameterSetA => {
                let changed = self
                    .staged_sps
                    .as_ref()
                    .map_or(true, |sps| sps.payload() != unit.payload());
                if changed {
                    // A PPS staged under the old SPS must not be bundled with the new one
                    self.epoch += 1;
                    self.staged_pps = None;
                }
                self.staged_sps = Some(unit.clone());
                None
            }
            UnitKind::ParameterSetB => {
                self.staged_pps = Some(unit.clone());
                None
            }
            UnitKind::Intra => {
                let (Some(sps), Some(pps)) = (&self.staged_sps, &self.staged_pps) else {
                    return None;
                };
                self.bundle = Some(ParameterBundle {
                    sps: sps.clone(),
                    pps: pps.clone(),
                    intra: unit.clone(),
                    epoch: self.epoch,
                });
                self.commits += 1;
                self.bundle.as_ref()
            }
            UnitKind::Inter | UnitKind::Other => None,
        }
    }

    /// Last committed bundle, if any
    pub fn current_bundle(&self) -> Option<&ParameterBundle> {
        self.bundle.as_ref()
    }

    /// Current configuration epoch
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of bundles committed so far
    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Check if a new consumer can start decoding immediately
    pub fn is_ready(&self) -> bool {
        self.bundle.is_some()
    }
}
