use super::nal::{NAL_HEADER_SIZE, NalUnit, NalUnitType};
use super::rtp::{RTP_HEADER_SIZE, RtpSequencer};
use crate::error::FramingError;

/// Default RTP payload limit (RTP header excluded).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1400;

/// FU indicator plus FU header.
pub const FU_HEADER_SIZE: usize = 2;

/// Split one NAL unit into RTP payloads (RFC 6184).
///
/// - **Single NAL Unit** (§5.6): a unit whose header and payload fit within
///   `max_payload_size` is sent as-is.
///
/// - **FU-A Fragmentation** (§5.8): larger units are split. Each fragment
///   carries a 2-byte FU header before the NAL payload:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (max_payload_size - 2 bytes, last may be shorter)
///   ```
///
/// The returned buffers are RTP payloads only; no RTP header is attached.
pub fn fragment(
    unit: &NalUnit<'_>,
    max_payload_size: usize,
) -> Result<Vec<Vec<u8>>, FramingError> {
    if !unit.has_payload() {
        return Err(FramingError::EmptyUnit);
    }
    if max_payload_size < FU_HEADER_SIZE + 1 {
        return Err(FramingError::PayloadSizeTooSmall {
            max: max_payload_size,
        });
    }

    if unit.wire_size() <= max_payload_size {
        return Ok(vec![unit.to_bytes()]);
    }

    let header = unit.header;
    // FU indicator: F and NRI from original NAL, type = 28 (FU-A)
    let fu_indicator =
        ((header.forbidden as u8) << 7) | (header.nri << 5) | NalUnitType::FuA.as_u8();
    let nal_type = header.unit_type.as_u8();
    let max_fragment = max_payload_size - FU_HEADER_SIZE;

    let chunks = unit.payload.chunks(max_fragment);
    let count = chunks.len();
    let packets = chunks
        .enumerate()
        .map(|(i, chunk)| {
            // FU header: S=start, E=end, R=0, Type=original NAL type
            let start_bit = if i == 0 { 0x80 } else { 0x00 };
            let end_bit = if i + 1 == count { 0x40 } else { 0x00 };

            let mut packet = Vec::with_capacity(FU_HEADER_SIZE + chunk.len());
            packet.push(fu_indicator);
            packet.push(start_bit | end_bit | nal_type);
            packet.extend_from_slice(chunk);
            packet
        })
        .collect::<Vec<_>>();

    tracing::trace!(
        nal_type,
        nal_size = unit.wire_size(),
        fragments = packets.len(),
        "FU-A fragmented NAL unit"
    );

    Ok(packets)
}

/// H.264 RTP packetizer (RFC 6184, packetization-mode=1).
///
/// Turns the NAL units of one access unit into complete RTP packets
/// sharing one timestamp.
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an access unit (frame boundary) and nowhere else.
#[derive(Debug)]
pub struct H264Packetizer {
    sequencer: RtpSequencer,
    max_payload_size: usize,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            sequencer: RtpSequencer::new(pt, ssrc),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Create with a random SSRC and initial sequence number (RFC 3550 §5.1, §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            sequencer: RtpSequencer::with_random_ssrc(pt),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.sequencer.ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.sequencer.sequence()
    }

    /// Packetize an access unit into RTP packets.
    ///
    /// Every unit is fragmented before any sequence number is consumed, so
    /// a rejected access unit leaves the stream's sequence untouched.
    pub fn packetize(
        &mut self,
        units: &[NalUnit<'_>],
        timestamp: u32,
    ) -> Result<Vec<Vec<u8>>, FramingError> {
        if units.is_empty() {
            return Err(FramingError::EmptyAccessUnit);
        }

        let payloads = units
            .iter()
            .map(|unit| fragment(unit, self.max_payload_size))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        let last = payloads.len() - 1;
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let hdr = self.sequencer.next_header(i == last, timestamp).write();
                let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
                packet.extend_from_slice(&hdr);
                packet.extend_from_slice(&payload);
                packet
            })
            .collect::<Vec<_>>();

        tracing::trace!(
            nal_count = units.len(),
            rtp_packets = packets.len(),
            seq = self.sequencer.sequence(),
            ts = timestamp,
            "access unit packetized"
        );

        Ok(packets)
    }
}

/// Extract NAL units from an H.264 Annex B bitstream.
///
/// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
/// `00 00 01`) and returns the NAL data between them, excluding
/// the start codes themselves.
///
/// The start code length is tracked per-NAL to ensure boundaries
/// between adjacent NALs are computed correctly when mixed 3-byte
/// and 4-byte start codes appear.
pub fn extract_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut i = 0usize;

    // (nal_data_start_index, start_code_length)
    let mut start_entries: Vec<(usize, usize)> = Vec::new();

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            start_entries.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            start_entries.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    start_entries
        .iter()
        .enumerate()
        .filter_map(|(idx, &(start, _))| {
            let end = match start_entries.get(idx + 1) {
                Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
                None => data.len(),
            };
            (start < end).then(|| &data[start..end])
        })
        .collect()
}
