//! H.264 NAL unit model (RFC 6184 §1.3).
//!
//! ```text
//! +---------------+
//! |0|1|2|3|4|5|6|7|
//! +-+-+-+-+-+-+-+-+
//! |F|NRI|  Type   |
//! +---------------+
//! ```

use std::borrow::Cow;

use crate::error::FramingError;

/// Size of the H.264 NAL unit header in bytes.
pub const NAL_HEADER_SIZE: usize = 1;

/// NAL unit type code (5 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalUnitType {
    /// Coded slice of a non-IDR picture.
    Slice,
    SliceDataA,
    SliceDataB,
    SliceDataC,
    /// Coded slice of an IDR picture (keyframe).
    Idr,
    Sei,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    FillerData,
    /// Single-time aggregation packet (RFC 6184 §5.7.1).
    StapA,
    /// Fragmentation unit, non-interleaved (RFC 6184 §5.8).
    FuA,
    Other(u8),
}

impl NalUnitType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x1f {
            1 => Self::Slice,
            2 => Self::SliceDataA,
            3 => Self::SliceDataB,
            4 => Self::SliceDataC,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            10 => Self::EndOfSequence,
            11 => Self::EndOfStream,
            12 => Self::FillerData,
            24 => Self::StapA,
            28 => Self::FuA,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Slice => 1,
            Self::SliceDataA => 2,
            Self::SliceDataB => 3,
            Self::SliceDataC => 4,
            Self::Idr => 5,
            Self::Sei => 6,
            Self::Sps => 7,
            Self::Pps => 8,
            Self::AccessUnitDelimiter => 9,
            Self::EndOfSequence => 10,
            Self::EndOfStream => 11,
            Self::FillerData => 12,
            Self::StapA => 24,
            Self::FuA => 28,
            Self::Other(v) => v & 0x1f,
        }
    }

    /// Video coding layer units carry picture data and need a presentation time.
    pub fn is_vcl(self) -> bool {
        matches!(
            self,
            Self::Slice | Self::SliceDataA | Self::SliceDataB | Self::SliceDataC | Self::Idr
        )
    }
}

/// Parsed one-byte NAL unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    /// `forbidden_zero_bit`; set by some senders to flag known corruption.
    pub forbidden: bool,
    /// `nal_ref_idc` (2 bits). Non-zero means the unit is used for reference.
    pub nri: u8,
    pub unit_type: NalUnitType,
}

impl NalHeader {
    pub fn parse(byte: u8) -> Self {
        Self {
            forbidden: byte & 0x80 != 0,
            nri: (byte >> 5) & 0x03,
            unit_type: NalUnitType::from_u8(byte),
        }
    }

    pub fn to_byte(self) -> u8 {
        ((self.forbidden as u8) << 7) | ((self.nri & 0x03) << 5) | self.unit_type.as_u8()
    }

    /// Whether other pictures may reference this unit.
    pub fn is_reference(self) -> bool {
        self.nri != 0
    }
}

/// A single NAL unit: header plus payload bytes.
///
/// On the send path the payload borrows the caller's encoded frame; units
/// rebuilt from fragments own their bytes, since the datagrams they came
/// from are gone by the time the unit is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit<'a> {
    pub header: NalHeader,
    pub payload: Cow<'a, [u8]>,
}

impl<'a> NalUnit<'a> {
    /// View `data` (header byte followed by payload) as a NAL unit without copying.
    pub fn parse(data: &'a [u8]) -> Result<Self, FramingError> {
        let (&first, payload) = data.split_first().ok_or(FramingError::MissingHeader)?;
        Ok(Self {
            header: NalHeader::parse(first),
            payload: Cow::Borrowed(payload),
        })
    }

    pub fn owned(header: NalHeader, payload: Vec<u8>) -> NalUnit<'static> {
        NalUnit {
            header,
            payload: Cow::Owned(payload),
        }
    }

    pub fn unit_type(&self) -> NalUnitType {
        self.header.unit_type
    }

    /// Size on the wire, header included. Never less than one.
    pub fn wire_size(&self) -> usize {
        NAL_HEADER_SIZE + self.payload.len()
    }

    /// Whether any bytes follow the header.
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Header byte followed by the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size());
        out.push(self.header.to_byte());
        out.extend_from_slice(&self.payload);
        out
    }

    /// The unit prefixed with a 4-byte Annex B start code.
    pub fn to_annex_b(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.wire_size());
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.push(self.header.to_byte());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn into_owned(self) -> NalUnit<'static> {
        NalUnit {
            header: self.header,
            payload: Cow::Owned(self.payload.into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let h = NalHeader::parse(0x65);
        assert!(!h.forbidden);
        assert_eq!(h.nri, 3);
        assert_eq!(h.unit_type, NalUnitType::Idr);
        assert!(h.is_reference());
        assert_eq!(h.to_byte(), 0x65);
    }

    #[test]
    fn non_reference_slice() {
        let h = NalHeader::parse(0x01);
        assert_eq!(h.unit_type, NalUnitType::Slice);
        assert!(!h.is_reference());
    }

    #[test]
    fn unknown_type_preserved() {
        let h = NalHeader::parse(0x7e);
        assert_eq!(h.unit_type, NalUnitType::Other(30));
        assert_eq!(h.to_byte(), 0x7e);
    }

    #[test]
    fn vcl_classification() {
        assert!(NalUnitType::Idr.is_vcl());
        assert!(NalUnitType::Slice.is_vcl());
        assert!(!NalUnitType::Sps.is_vcl());
        assert!(!NalUnitType::Sei.is_vcl());
    }

    #[test]
    fn parse_borrows() {
        let data = [0x67, 0x42, 0x00, 0x1e];
        let nal = NalUnit::parse(&data).unwrap();
        assert!(matches!(nal.payload, Cow::Borrowed(_)));
        assert_eq!(nal.unit_type(), NalUnitType::Sps);
        assert_eq!(nal.wire_size(), 4);
        assert_eq!(nal.to_bytes(), data);
    }

    #[test]
    fn header_only_unit() {
        let nal = NalUnit::parse(&[0x09]).unwrap();
        assert_eq!(nal.wire_size(), 1);
        assert!(!nal.has_payload());
        assert!(NalUnit::parse(&[0x09, 0x10]).unwrap().has_payload());
    }

    #[test]
    fn parse_empty_fails() {
        assert_eq!(NalUnit::parse(&[]), Err(FramingError::MissingHeader));
    }

    #[test]
    fn annex_b_prefix() {
        let nal = NalUnit::parse(&[0x68, 0xce]).unwrap();
        assert_eq!(nal.to_annex_b(), vec![0, 0, 0, 1, 0x68, 0xce]);
    }
}
