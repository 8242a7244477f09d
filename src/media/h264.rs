//! H.264 Annex-B units
//!
//! The capture helper emits H.264 in Annex-B form: every NAL unit is preceded
//! by a start code and the first byte after the start code is the NAL header.
//!
//! ```text
//! 00 00 00 01 | F(1) NRI(2) Type(5) | payload ...
//! 00 00 01    | F(1) NRI(2) Type(5) | payload ...
//! ```
//!
//! Units keep their original start code so they can be forwarded to consumers
//! without copying.

use bytes::Bytes;

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice = 1,
    /// Slice data partition A
    SlicePartA = 2,
    /// Slice data partition B
    SlicePartB = 3,
    /// Slice data partition C
    SlicePartC = 4,
    /// IDR slice (keyframe)
    Idr = 5,
    /// Supplemental enhancement information
    Sei = 6,
    /// Sequence parameter set
    Sps = 7,
    /// Picture parameter set
    Pps = 8,
    /// Access unit delimiter
    Aud = 9,
    /// End of sequence
    EndSeq = 10,
    /// End of stream
    EndStream = 11,
    /// Filler data
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, NaluType::Idr)
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// Classification that drives caching and fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Sequence parameter set
    ParameterSetA,
    /// Picture parameter set
    ParameterSetB,
    /// IDR slice, decodable without prior frames
    Intra,
    /// Non-IDR slice
    Inter,
    /// SEI, AUD, filler and anything else
    Other,
}

impl UnitKind {
    /// Classify from the NAL header byte
    pub fn from_header(b: u8) -> Self {
        match NaluType::from_byte(b) {
            Some(NaluType::Sps) => UnitKind::ParameterSetA,
            Some(NaluType::Pps) => UnitKind::ParameterSetB,
            Some(NaluType::Idr) => UnitKind::Intra,
            Some(
                NaluType::Slice
                | NaluType::SlicePartA
                | NaluType::SlicePartB
                | NaluType::SlicePartC,
            ) => UnitKind::Inter,
            _ => UnitKind::Other,
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, UnitKind::ParameterSetA | UnitKind::ParameterSetB)
    }
}

/// One framed NAL unit
///
/// Cheap to clone: the bytes are reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    kind: UnitKind,
    /// Start code + header + payload
    data: Bytes,
    start_code_len: usize,
    /// Presentation timestamp in microseconds, when the tunnel carries one
    pts: Option<u64>,
}

impl NalUnit {
    /// Wrap an Annex-B unit
    ///
    /// Returns `None` if `data` does not begin with a start code followed by
    /// at least a header byte.
    pub fn new(data: Bytes, pts: Option<u64>) -> Option<Self> {
        let start_code_len = start_code_len(&data)?;
        let header = *data.get(start_code_len)?;

        Some(Self {
            kind: UnitKind::from_header(header),
            data,
            start_code_len,
            pts,
        })
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Raw NAL type from the header byte
    pub fn nalu_type(&self) -> Option<NaluType> {
        NaluType::from_byte(self.header())
    }

    pub fn header(&self) -> u8 {
        self.data[self.start_code_len]
    }

    /// Full Annex-B bytes, start code included
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// NAL header + payload without the start code
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start_code_len..]
    }

    pub fn pts(&self) -> Option<u64> {
        self.pts
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Length of the start code at the beginning of `data`, if any
pub fn start_code_len(data: &[u8]) -> Option<usize> {
    if data.starts_with(&[0, 0, 0, 1]) {
        Some(4)
    } else if data.starts_with(&[0, 0, 1]) {
        Some(3)
    } else {
        None
    }
}

/// Find the next start code in `data[from..]`
///
/// Returns `(position, length)`. A zero byte directly before `00 00 01` is
/// folded into a 4-byte start code as long as it lies at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < 3 || from > data.len() - 3 {
        return None;
    }

    let mut i = from;
    while i + 3 <= data.len() {
        // Skip ahead quickly: a start code needs data[i + 2] == 1
        if data[i + 2] > 1 {
            i += 3;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Split a buffer holding complete Annex-B units into individual units
///
/// Returns `None` if the buffer does not begin with a start code. Empty units
/// (two adjacent start codes) are skipped.
pub fn split_annex_b(data: &Bytes) -> Option<Vec<Bytes>> {
    let first = start_code_len(data)?;
    let mut units = Vec::new();
    let mut start = 0;
    let mut search = first;

    while let Some((pos, len)) = find_start_code(data, search) {
        if pos > search {
            units.push(data.slice(start..pos));
        }
        start = pos;
        search = pos + len;
    }
    if data.len() > search {
        units.push(data.slice(start..));
    }

    Some(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nalu_type() {
        assert_eq!(NaluType::from_byte(0x65), Some(NaluType::Idr));
        assert_eq!(NaluType::from_byte(0x67), Some(NaluType::Sps));
        assert_eq!(NaluType::from_byte(0x68), Some(NaluType::Pps));
        assert_eq!(NaluType::from_byte(0x41), Some(NaluType::Slice));
        assert_eq!(NaluType::from_byte(0x00), None);
    }

    #[test]
    fn test_nalu_type_is_keyframe() {
        assert!(NaluType::Idr.is_keyframe());
        assert!(!NaluType::Slice.is_keyframe());
        assert!(!NaluType::Sps.is_keyframe());
        assert!(!NaluType::Pps.is_keyframe());
    }

    #[test]
    fn test_nalu_type_is_parameter_set() {
        assert!(NaluType::Sps.is_parameter_set());
        assert!(NaluType::Pps.is_parameter_set());
        assert!(!NaluType::Idr.is_parameter_set());
        assert!(!NaluType::Slice.is_parameter_set());
    }

    #[test]
    fn test_unit_kind_from_header() {
        assert_eq!(UnitKind::from_header(0x67), UnitKind::ParameterSetA);
        assert_eq!(UnitKind::from_header(0x68), UnitKind::ParameterSetB);
        assert_eq!(UnitKind::from_header(0x65), UnitKind::Intra);
        assert_eq!(UnitKind::from_header(0x41), UnitKind::Inter);
        assert_eq!(UnitKind::from_header(0x01), UnitKind::Inter);
        assert_eq!(UnitKind::from_header(0x06), UnitKind::Other);
        assert_eq!(UnitKind::from_header(0x09), UnitKind::Other);
        assert_eq!(UnitKind::from_header(0x1F), UnitKind::Other);
    }

    #[test]
    fn test_nal_unit_four_byte_start_code() {
        let unit = NalUnit::new(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0x00]), None).unwrap();
        assert_eq!(unit.kind(), UnitKind::ParameterSetA);
        assert_eq!(unit.header(), 0x67);
        assert_eq!(unit.payload(), &[0x67, 0x42, 0x00]);
        assert_eq!(unit.len(), 7);
        assert_eq!(unit.nalu_type(), Some(NaluType::Sps));
    }

    #[test]
    fn test_nal_unit_three_byte_start_code() {
        let unit = NalUnit::new(Bytes::from_static(&[0, 0, 1, 0x65, 0x88]), Some(33)).unwrap();
        assert_eq!(unit.kind(), UnitKind::Intra);
        assert_eq!(unit.payload(), &[0x65, 0x88]);
        assert_eq!(unit.pts(), Some(33));
    }

    #[test]
    fn test_nal_unit_rejects_bad_input() {
        assert!(NalUnit::new(Bytes::from_static(&[0x65, 0x88]), None).is_none());
        assert!(NalUnit::new(Bytes::from_static(&[0, 0, 0, 1]), None).is_none());
        assert!(NalUnit::new(Bytes::new(), None).is_none());
    }

    #[test]
    fn test_find_start_code() {
        let data = [0x41, 0x9A, 0, 0, 1, 0x65];
        assert_eq!(find_start_code(&data, 0), Some((2, 3)));

        let data = [0x41, 0x9A, 0, 0, 0, 1, 0x65];
        assert_eq!(find_start_code(&data, 0), Some((2, 4)));

        // The leading zero sits before `from`, so only a 3-byte code counts
        assert_eq!(find_start_code(&data, 3), Some((3, 3)));

        assert_eq!(find_start_code(&[0x41, 0x9A, 0x00], 0), None);
        assert_eq!(find_start_code(&[0, 0], 0), None);
        assert_eq!(find_start_code(&[0, 0, 1], 1), None);
    }

    #[test]
    fn test_find_start_code_with_high_bytes() {
        let data = [0xFF, 0xFF, 0xFF, 0x02, 0, 0, 1, 0x41];
        assert_eq!(find_start_code(&data, 0), Some((4, 3)));
    }

    #[test]
    fn test_split_annex_b() {
        let data = Bytes::from_static(&[
            0, 0, 0, 1, 0x67, 0x42, // SPS
            0, 0, 0, 1, 0x68, 0xCE, // PPS
            0, 0, 1, 0x65, 0x88, 0x84, // IDR
        ]);

        let units = split_annex_b(&data).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &[0, 0, 0, 1, 0x67, 0x42]);
        assert_eq!(&units[1][..], &[0, 0, 0, 1, 0x68, 0xCE]);
        assert_eq!(&units[2][..], &[0, 0, 1, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_split_annex_b_skips_empty_units() {
        let data = Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 1, 0x41, 0x9A]);
        let units = split_annex_b(&data).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &[0, 0, 0, 1, 0x41, 0x9A]);
    }

    #[test]
    fn test_split_annex_b_requires_start_code() {
        assert!(split_annex_b(&Bytes::from_static(&[0x65, 0x88])).is_none());
    }
}
