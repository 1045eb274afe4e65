//! RTP sequence number continuity (RFC 3550 §A.1).
//!
//! Sequence numbers are 16-bit and wrap at 65536, so ordering is circular:
//! `a` is after `b` when `a - b (mod 65536)` lies in `1..=32767`.

/// How a packet's sequence number relates to the last accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Exactly one after the previous packet (or the first packet seen).
    InOrder,
    /// Not newer than the previous packet: late, duplicated or reordered.
    Reordered,
    /// This many packets are missing between the previous and this one.
    Lost(u16),
}

/// Classify `current` against `previous` by circular delta.
pub fn classify(previous: Option<u16>, current: u16) -> Continuity {
    let Some(previous) = previous else {
        return Continuity::InOrder;
    };

    match current.wrapping_sub(previous) as i16 {
        d if d <= 0 => Continuity::Reordered,
        1 => Continuity::InOrder,
        d => Continuity::Lost(d as u16 - 1),
    }
}

/// Tracks the last accepted sequence number of one stream.
///
/// The baseline moves to every arrival, anomalous or not, so a burst of
/// reordering cannot wedge the tracker.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    previous: Option<u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, current: u16) -> Continuity {
        let continuity = classify(self.previous, current);
        self.previous = Some(current);
        continuity
    }

    pub fn previous(&self) -> Option<u16> {
        self.previous
    }

    /// Forget the baseline; the next packet is treated as the first.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_packet_in_order() {
        assert_eq!(classify(None, 1234), Continuity::InOrder);
    }

    #[test]
    fn successor_in_order_for_every_value() {
        for p in 0..=u16::MAX {
            assert_eq!(classify(Some(p), p.wrapping_add(1)), Continuity::InOrder);
        }
    }

    #[test]
    fn same_value_reordered() {
        for p in [0, 1, 32767, 32768, 65535] {
            assert_eq!(classify(Some(p), p), Continuity::Reordered);
        }
    }

    #[test]
    fn forward_gap_reports_loss() {
        for p in [0u16, 100, 65000, 65535] {
            for k in [2u16, 3, 1000, 32767] {
                assert_eq!(
                    classify(Some(p), p.wrapping_add(k)),
                    Continuity::Lost(k - 1),
                    "p={p} k={k}"
                );
            }
        }
    }

    #[test]
    fn half_range_back_is_reordered() {
        assert_eq!(classify(Some(100), 100u16.wrapping_add(32768)), Continuity::Reordered);
        assert_eq!(classify(Some(100), 99), Continuity::Reordered);
    }

    #[test]
    fn wraparound_in_order() {
        assert_eq!(classify(Some(65535), 0), Continuity::InOrder);
        assert_eq!(classify(Some(65534), 1), Continuity::Lost(2));
    }

    #[test]
    fn tracker_rebaselines_on_anomaly() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.track(10), Continuity::InOrder);
        assert_eq!(t.track(14), Continuity::Lost(3));
        assert_eq!(t.track(12), Continuity::Reordered);
        // Baseline is now 12, not 14.
        assert_eq!(t.track(13), Continuity::InOrder);
        assert_eq!(t.previous(), Some(13));
    }

    #[test]
    fn tracker_reset() {
        let mut t = SequenceTracker::new();
        t.track(10);
        t.reset();
        assert_eq!(t.track(500), Continuity::InOrder);
    }
}
