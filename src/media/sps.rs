//! Sequence parameter set parsing
//!
//! Only the fields needed to recover the coded picture size are interpreted.
//! The size is what consumers use to letterbox the video and map pointer
//! coordinates back to the device, and it changes whenever the device
//! rotates.
//!
//! SPS fields are Exp-Golomb coded, and the NAL payload carries emulation
//! prevention bytes (`00 00 03`) that must be removed first.

use crate::device::Resolution;

/// Profiles that carry chroma format and scaling matrix fields
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// Parsed subset of an SPS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u32,
    pub chroma_format_idc: u32,
    pub width: u32,
    pub height: u32,
}

/// SPS parse failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpsError {
    /// Ran out of bits
    Truncated,
    /// Header byte is not an SPS
    NotSps,
    /// A field holds a value outside its legal range
    OutOfRange,
}

impl std::fmt::Display for SpsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpsError::Truncated => write!(f, "SPS truncated"),
            SpsError::NotSps => write!(f, "not an SPS unit"),
            SpsError::OutOfRange => write!(f, "SPS field out of range"),
        }
    }
}

impl std::error::Error for SpsError {}

impl Sps {
    /// Parse from a NAL payload (header byte first, no start code)
    pub fn parse(nal: &[u8]) -> Result<Self, SpsError> {
        let (&header, rest) = nal.split_first().ok_or(SpsError::Truncated)?;
        if header & 0x1F != 7 {
            return Err(SpsError::NotSps);
        }
        Self::parse_rbsp(&unescape(rest))
    }

    /// Parse from the RBSP that follows the header byte
    pub fn parse_rbsp(rbsp: &[u8]) -> Result<Self, SpsError> {
        let mut r = BitReader::new(rbsp);

        let profile_idc = r.read_bits(8)? as u8;
        let _constraint_flags = r.read_bits(8)?;
        let level_idc = r.read_bits(8)? as u8;
        let seq_parameter_set_id = r.read_ue()?;
        if seq_parameter_set_id > 31 {
            return Err(SpsError::OutOfRange);
        }

        let mut chroma_format_idc: u32 = 1;
        let mut separate_colour_plane = false;

        if HIGH_PROFILES.contains(&profile_idc) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc > 3 {
                return Err(SpsError::OutOfRange);
            }
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_bit()?;
            }
            let _bit_depth_luma = r.read_ue()?;
            let _bit_depth_chroma = r.read_ue()?;
            let _qpprime_y_zero_transform_bypass = r.read_bit()?;
            if r.read_bit()? {
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let _log2_max_frame_num = r.read_ue()?;
        let pic_order_cnt_type = r.read_ue()?;
        match pic_order_cnt_type {
            0 => {
                let _log2_max_poc_lsb = r.read_ue()?;
            }
            1 => {
                let _delta_pic_order_always_zero = r.read_bit()?;
                let _offset_for_non_ref_pic = r.read_se()?;
                let _offset_for_top_to_bottom_field = r.read_se()?;
                let cycle = r.read_ue()?;
                if cycle > 255 {
                    return Err(SpsError::OutOfRange);
                }
                for _ in 0..cycle {
                    let _offset_for_ref_frame = r.read_se()?;
                }
            }
            2 => {}
            _ => return Err(SpsError::OutOfRange),
        }

        let _max_num_ref_frames = r.read_ue()?;
        let _gaps_in_frame_num_allowed = r.read_bit()?;
        let width_in_mbs = r.read_ue()? + 1;
        let height_in_map_units = r.read_ue()? + 1;
        let frame_mbs_only = r.read_bit()?;
        if !frame_mbs_only {
            let _mb_adaptive_frame_field = r.read_bit()?;
        }
        let _direct_8x8_inference = r.read_bit()?;

        let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
        if r.read_bit()? {
            crop_left = r.read_ue()?;
            crop_right = r.read_ue()?;
            crop_top = r.read_ue()?;
            crop_bottom = r.read_ue()?;
        }

        let field_factor: u32 = if frame_mbs_only { 1 } else { 2 };
        let chroma_array_type = if separate_colour_plane {
            0
        } else {
            chroma_format_idc
        };
        let (crop_unit_x, crop_unit_y): (u32, u32) = match chroma_array_type {
            0 => (1, field_factor),
            1 => (2, 2 * field_factor),
            2 => (2, field_factor),
            _ => (1, field_factor),
        };

        let coded_width = width_in_mbs.checked_mul(16).ok_or(SpsError::OutOfRange)?;
        let coded_height = height_in_map_units
            .checked_mul(16 * field_factor)
            .ok_or(SpsError::OutOfRange)?;
        let width = coded_width
            .checked_sub(crop_unit_x.saturating_mul(crop_left.saturating_add(crop_right)))
            .ok_or(SpsError::OutOfRange)?;
        let height = coded_height
            .checked_sub(crop_unit_y.saturating_mul(crop_top.saturating_add(crop_bottom)))
            .ok_or(SpsError::OutOfRange)?;

        Ok(Sps {
            profile_idc,
            level_idc,
            seq_parameter_set_id,
            chroma_format_idc,
            width,
            height,
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), SpsError> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            if !(-128..=127).contains(&delta) {
                return Err(SpsError::OutOfRange);
            }
            next_scale = (last_scale + delta + 256).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Remove emulation prevention bytes (`00 00 03` -> `00 00`)
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// MSB-first bit reader
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<bool, SpsError> {
        let byte = *self.data.get(self.pos / 8).ok_or(SpsError::Truncated)?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    fn read_bits(&mut self, n: u32) -> Result<u32, SpsError> {
        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Ok(value)
    }

    /// Unsigned Exp-Golomb
    fn read_ue(&mut self) -> Result<u32, SpsError> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(SpsError::OutOfRange);
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// Signed Exp-Golomb
    fn read_se(&mut self) -> Result<i32, SpsError> {
        let k = self.read_ue()? as i64;
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Ok(value as i32)
    }
}
