//! H.264 RTP depacketizer (RFC 6184, Single NAL Unit + FU-A).
//!
//! Single NAL unit packets are returned immediately. FU-A fragments are
//! accumulated in a reassembly buffer that only accepts strictly
//! consecutive sequence numbers; any gap discards the partial unit, since
//! the bytes collected so far cannot be trusted to form a valid NAL unit.

use super::nal::{NalHeader, NalUnit, NalUnitType};
use super::rtp::RtpHeader;
use crate::error::{ProtocolErrorKind, Result};

/// A NAL unit being rebuilt from FU-A fragments.
#[derive(Debug)]
struct ReassemblyBuffer {
    header: NalHeader,
    data: Vec<u8>,
    last_sequence: u16,
}

#[derive(Debug, Default)]
pub struct Depacketizer {
    buffer: Option<ReassemblyBuffer>,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fragmented unit is partially assembled.
    pub fn is_reassembling(&self) -> bool {
        self.buffer.is_some()
    }

    /// Drop any partially assembled unit.
    pub fn reset(&mut self) {
        if let Some(buf) = self.buffer.take() {
            tracing::debug!(
                nal_type = buf.header.unit_type.as_u8(),
                bytes = buf.data.len(),
                "discarding partial NAL unit"
            );
        }
    }

    /// Feed one RTP payload. Returns the NAL units it completes (usually
    /// zero or one).
    pub fn receive(&mut self, header: &RtpHeader, payload: &[u8]) -> Result<Vec<NalUnit<'static>>> {
        let &first = payload.first().ok_or(ProtocolErrorKind::EmptyPayload)?;

        match NalUnitType::from_u8(first) {
            NalUnitType::FuA => self.receive_fragment(header.sequence_number, payload),
            NalUnitType::StapA => {
                Err(ProtocolErrorKind::UnsupportedPacketization(NalUnitType::StapA.as_u8()).into())
            }
            NalUnitType::Other(t @ (0 | 25..=27 | 29..=31)) => {
                Err(ProtocolErrorKind::UnsupportedPacketization(t).into())
            }
            _ => {
                let unit = NalUnit::parse(payload)?.into_owned();
                tracing::trace!(
                    seq = header.sequence_number,
                    nal_type = first & 0x1f,
                    size = payload.len(),
                    "single NAL unit"
                );
                Ok(vec![unit])
            }
        }
    }

    fn receive_fragment(&mut self, seq: u16, payload: &[u8]) -> Result<Vec<NalUnit<'static>>> {
        let [fu_indicator, fu_header, data @ ..] = payload else {
            self.reset();
            return Err(ProtocolErrorKind::TruncatedPayload.into());
        };

        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        // F and NRI come from the indicator, type from the FU header.
        let original = NalHeader::parse((fu_indicator & 0xe0) | (fu_header & 0x1f));

        if start && end {
            self.reset();
            return Err(ProtocolErrorKind::InvalidFragmentHeader.into());
        }

        if start {
            if self.buffer.is_some() {
                tracing::warn!(seq, "start fragment while reassembling, previous unit dropped");
                self.reset();
            }
            self.buffer = Some(ReassemblyBuffer {
                header: original,
                data: data.to_vec(),
                last_sequence: seq,
            });
            return Ok(Vec::new());
        }

        let mut buf = self.buffer.take().ok_or(ProtocolErrorKind::OrphanFragment)?;

        let expected = buf.last_sequence.wrapping_add(1);
        if seq != expected {
            tracing::debug!(
                expected,
                got = seq,
                bytes = buf.data.len(),
                "fragment gap, partial NAL unit dropped"
            );
            return Err(ProtocolErrorKind::FragmentGap { expected, got: seq }.into());
        }

        buf.data.extend_from_slice(data);
        buf.last_sequence = seq;

        if end {
            tracing::trace!(
                nal_type = buf.header.unit_type.as_u8(),
                size = buf.data.len() + 1,
                "FU-A NAL unit reassembled"
            );
            Ok(vec![NalUnit::owned(buf.header, buf.data)])
        } else {
            self.buffer = Some(buf);
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::media::h264::fragment;

    fn header(seq: u16) -> RtpHeader {
        RtpHeader {
            marker: false,
            payload_type: 96,
            sequence_number: seq,
            timestamp: 0,
            ssrc: 1,
        }
    }

    fn kind(err: StreamError) -> ProtocolErrorKind {
        match err {
            StreamError::Protocol { kind } => kind,
            other => panic!("unexpected error: {other}"),
        }
    }

    fn sample_unit(len: usize) -> NalUnit<'static> {
        let payload = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        NalUnit::owned(NalHeader::parse(0x65), payload)
    }

    fn feed(d: &mut Depacketizer, first_seq: u16, packets: &[Vec<u8>]) -> Vec<NalUnit<'static>> {
        let mut out = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            let seq = first_seq.wrapping_add(i as u16);
            out.extend(d.receive(&header(seq), p).unwrap());
        }
        out
    }

    #[test]
    fn single_unit_emitted_immediately() {
        let mut d = Depacketizer::new();
        let units = d.receive(&header(1), &[0x67, 0x42, 0x00, 0x1e]).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_type(), NalUnitType::Sps);
        assert_eq!(&units[0].payload[..], &[0x42, 0x00, 0x1e]);
    }

    #[test]
    fn single_unit_does_not_disturb_reassembly() {
        let mut d = Depacketizer::new();
        let unit = sample_unit(300);
        let frags = fragment(&unit, 200).unwrap();
        d.receive(&header(10), &frags[0]).unwrap();
        assert_eq!(d.receive(&header(50), &[0x06, 0x05]).unwrap().len(), 1);
        assert!(d.is_reassembling());
    }

    #[test]
    fn two_fragments_reassemble() {
        let mut d = Depacketizer::new();
        let unit = sample_unit(300);
        let frags = fragment(&unit, 200).unwrap();
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0][1] & 0xC0, 0x80);
        assert_eq!(frags[0].len() - 2, 198);
        assert_eq!(frags[1][1] & 0xC0, 0x40);
        assert_eq!(frags[1].len() - 2, 102);

        let out = feed(&mut d, 100, &frags);
        assert_eq!(out, vec![unit]);
        assert!(!d.is_reassembling());
    }

    #[test]
    fn round_trip_across_sizes() {
        for max in [3usize, 4, 17, 200, 1400] {
            for len in [1usize, 2, 3, 150, 1399, 1400, 5000] {
                let unit = sample_unit(len);
                let frags = fragment(&unit, max).unwrap();
                let mut d = Depacketizer::new();
                let out = feed(&mut d, 65530, &frags);
                assert_eq!(out.len(), 1, "max={max} len={len}");
                assert_eq!(out[0].header, unit.header);
                assert_eq!(out[0].payload, unit.payload);
            }
        }
    }

    #[test]
    fn gap_discards_partial_unit() {
        let unit = sample_unit(1000);
        let frags = fragment(&unit, 200).unwrap();
        assert!(frags.len() > 3);

        let mut d = Depacketizer::new();
        d.receive(&header(1), &frags[0]).unwrap();
        d.receive(&header(2), &frags[1]).unwrap();
        let err = d.receive(&header(4), &frags[3]).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::FragmentGap { expected: 3, got: 4 });
        assert!(!d.is_reassembling());

        // Remaining fragments have no buffer to join.
        for (i, frag) in frags.iter().enumerate().skip(4) {
            let err = d.receive(&header(1 + i as u16), frag).unwrap_err();
            assert_eq!(kind(err), ProtocolErrorKind::OrphanFragment);
        }
    }

    #[test]
    fn reordered_end_fragment_discards() {
        let unit = sample_unit(300);
        let frags = fragment(&unit, 200).unwrap();
        let mut d = Depacketizer::new();
        d.receive(&header(9), &frags[0]).unwrap();
        let err = d.receive(&header(8), &frags[1]).unwrap_err();
        assert!(matches!(kind(err), ProtocolErrorKind::FragmentGap { .. }));
        assert!(!d.is_reassembling());
    }

    #[test]
    fn new_start_replaces_open_buffer() {
        let first = sample_unit(300);
        let second = NalUnit::owned(NalHeader::parse(0x41), vec![3; 300]);
        let a = fragment(&first, 200).unwrap();
        let b = fragment(&second, 200).unwrap();

        let mut d = Depacketizer::new();
        d.receive(&header(1), &a[0]).unwrap();
        d.receive(&header(2), &b[0]).unwrap();
        let out = d.receive(&header(3), &b[1]).unwrap();
        assert_eq!(out, vec![second]);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut d = Depacketizer::new();
        d.reset();
        assert!(!d.is_reassembling());

        let frags = fragment(&sample_unit(300), 200).unwrap();
        d.receive(&header(1), &frags[0]).unwrap();
        d.reset();
        d.reset();
        assert!(!d.is_reassembling());
        let err = d.receive(&header(2), &frags[1]).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::OrphanFragment);
    }

    #[test]
    fn malformed_payloads() {
        let mut d = Depacketizer::new();
        assert_eq!(
            kind(d.receive(&header(1), &[]).unwrap_err()),
            ProtocolErrorKind::EmptyPayload
        );
        assert_eq!(
            kind(d.receive(&header(1), &[0x7c]).unwrap_err()),
            ProtocolErrorKind::TruncatedPayload
        );
        assert_eq!(
            kind(d.receive(&header(1), &[0x7c, 0xC5, 0x00]).unwrap_err()),
            ProtocolErrorKind::InvalidFragmentHeader
        );
        assert_eq!(
            kind(d.receive(&header(1), &[0x78, 0x00]).unwrap_err()),
            ProtocolErrorKind::UnsupportedPacketization(24)
        );
        assert_eq!(
            kind(d.receive(&header(1), &[0x7d, 0x85, 0x00]).unwrap_err()),
            ProtocolErrorKind::UnsupportedPacketization(29)
        );
    }
}
