use crate::error::{ProtocolErrorKind, Result};

/// Size of the RTP fixed header with no CSRC list.
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Written headers always have version 2 and padding, extension and CSRC
/// count set to 0. Parsing accepts all three and skips over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Last packet of the current access unit.
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence_number: u16,
    /// Media clock units, not wall time.
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
}

impl RtpHeader {
    /// Parse an RTP packet into its header and payload.
    ///
    /// The returned payload excludes the CSRC list, any header extension
    /// (RFC 3550 §5.3.1) and trailing padding.
    pub fn parse(packet: &[u8]) -> Result<(Self, &[u8])> {
        if packet.len() < RTP_HEADER_SIZE {
            return Err(ProtocolErrorKind::TooShort.into());
        }

        let version = packet[0] >> 6;
        if version != 2 {
            return Err(ProtocolErrorKind::BadVersion(version).into());
        }
        let padding = packet[0] & 0x20 != 0;
        let extension = packet[0] & 0x10 != 0;
        let csrc_count = (packet[0] & 0x0f) as usize;

        let header = Self {
            marker: packet[1] & 0x80 != 0,
            payload_type: packet[1] & 0x7f,
            sequence_number: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        };

        let mut start = RTP_HEADER_SIZE + csrc_count * 4;
        if extension {
            // 16-bit profile field, 16-bit length in 32-bit words.
            let ext = packet
                .get(start..start + 4)
                .ok_or(ProtocolErrorKind::TruncatedPayload)?;
            let words = u16::from_be_bytes([ext[2], ext[3]]) as usize;
            start += 4 + words * 4;
        }

        let mut end = packet.len();
        if padding {
            let pad = packet[end - 1] as usize;
            if pad == 0 || pad > end {
                return Err(ProtocolErrorKind::TruncatedPayload.into());
            }
            end -= pad;
        }

        if start > end {
            return Err(ProtocolErrorKind::TruncatedPayload.into());
        }

        Ok((header, &packet[start..end]))
    }

    /// Serialize as a 12-byte fixed header.
    pub fn write(&self) -> [u8; RTP_HEADER_SIZE] {
        let first_byte: u8 = 2 << 6;
        let second_byte: u8 = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);

        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = first_byte;
        header[1] = second_byte;
        header[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }
}

/// Outbound RTP header state for one stream.
///
/// - **Sequence number**: 16-bit, wrapping, incremented on every packet.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
#[derive(Debug)]
pub struct RtpSequencer {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpSequencer {
    /// Create a new sequencer with explicit SSRC, starting at sequence 0.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP sequencer created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
        }
    }

    /// Create with a random SSRC and a random initial sequence number.
    ///
    /// RFC 3550 §5.1 recommends a random starting sequence number so that
    /// known-plaintext attacks on encryption are harder.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let mut sequencer = Self::new(pt, rand::random::<u32>());
        sequencer.sequence = rand::random::<u16>();
        sequencer
    }

    /// Sequence number the next header will carry.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Produce the next header and advance the sequence number.
    ///
    /// The `marker` bit signals the last packet of an access unit
    /// (RFC 6184 §5.1).
    pub fn next_header(&mut self, marker: bool, timestamp: u32) -> RtpHeader {
        let header = RtpHeader {
            marker,
            payload_type: self.pt,
            sequence_number: self.sequence,
            timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;

    fn make_sequencer() -> RtpSequencer {
        RtpSequencer::new(96, 0xAABBCCDD)
    }

    fn kind(err: StreamError) -> ProtocolErrorKind {
        match err {
            StreamError::Protocol { kind } => kind,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn version_is_2() {
        let mut s = make_sequencer();
        let buf = s.next_header(false, 0).write();
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut s = make_sequencer();
        let no_marker = s.next_header(false, 0).write();
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = s.next_header(true, 0).write();
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type() {
        let mut s = make_sequencer();
        let buf = s.next_header(false, 0).write();
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn sequence_increments() {
        let mut s = make_sequencer();
        let h1 = s.next_header(false, 0);
        let h2 = s.next_header(false, 0);
        assert_eq!(h2.sequence_number, h1.sequence_number + 1);
    }

    #[test]
    fn sequence_wraps() {
        let mut s = make_sequencer();
        s.sequence = u16::MAX;
        let h = s.next_header(false, 0);
        assert_eq!(h.sequence_number, u16::MAX);
        assert_eq!(s.sequence(), 0);
    }

    #[test]
    fn ssrc_and_timestamp_written() {
        let mut s = make_sequencer();
        let buf = s.next_header(false, 0x01020304).write();
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 0x01020304);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 0xAABBCCDD);
    }

    #[test]
    fn random_ssrc_differs() {
        let s1 = RtpSequencer::with_random_ssrc(96);
        let s2 = RtpSequencer::with_random_ssrc(96);
        assert_ne!(s1.ssrc, s2.ssrc);
    }

    #[test]
    fn parse_written_header() {
        let header = RtpHeader {
            marker: true,
            payload_type: 96,
            sequence_number: 4242,
            timestamp: 90_000,
            ssrc: 0x1234_5678,
        };
        let mut packet = header.write().to_vec();
        packet.extend_from_slice(&[0x65, 0x01]);

        let (parsed, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(payload, &[0x65, 0x01]);
    }

    #[test]
    fn parse_too_short() {
        let err = RtpHeader::parse(&[0x80; 11]).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::TooShort);
    }

    #[test]
    fn parse_bad_version() {
        let mut packet = [0u8; 13];
        packet[0] = 1 << 6;
        let err = RtpHeader::parse(&packet).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::BadVersion(1));
    }

    #[test]
    fn parse_skips_csrc_and_extension() {
        let mut packet = vec![0x80 | 0x10 | 0x01, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[9, 9, 9, 9]); // one CSRC
        packet.extend_from_slice(&[0xBE, 0xDE, 0, 1]); // extension, 1 word
        packet.extend_from_slice(&[7, 7, 7, 7]);
        packet.extend_from_slice(&[0x41, 0xAA]);

        let (_, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(payload, &[0x41, 0xAA]);
    }

    #[test]
    fn parse_strips_padding() {
        let mut packet = vec![0x80 | 0x20, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[0x41, 0xAA, 0, 0, 3]);
        let (_, payload) = RtpHeader::parse(&packet).unwrap();
        assert_eq!(payload, &[0x41, 0xAA]);
    }

    #[test]
    fn zero_padding_count_rejected() {
        let mut packet = vec![0x80 | 0x20, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        packet.extend_from_slice(&[0x41, 0xAA, 0]);
        let err = RtpHeader::parse(&packet).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::TruncatedPayload);
    }

    #[test]
    fn padding_past_payload_rejected() {
        let base = [0x80 | 0x20, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];

        // Longer than the whole packet.
        let mut packet = base.to_vec();
        packet.extend_from_slice(&[0x41, 200]);
        let err = RtpHeader::parse(&packet).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::TruncatedPayload);

        // Fits in the packet but eats into the fixed header.
        let mut packet = base.to_vec();
        packet.extend_from_slice(&[0x41, 5]);
        let err = RtpHeader::parse(&packet).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::TruncatedPayload);
    }

    #[test]
    fn parse_truncated_extension() {
        let packet = [0x80 | 0x10, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, 0xBE, 0xDE];
        let err = RtpHeader::parse(&packet).unwrap_err();
        assert_eq!(kind(err), ProtocolErrorKind::TruncatedPayload);
    }
}
