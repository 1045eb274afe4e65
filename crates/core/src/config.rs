use std::time::Duration;

use crate::media::h264::DEFAULT_MAX_PAYLOAD_SIZE;

/// Dynamic payload type conventionally used for H.264.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// 90 kHz video clock (RFC 6184 §8.1).
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Per-session configuration shared by sender and receiver roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// RTP payload type written on outbound packets.
    pub payload_type: u8,
    /// Media clock rate used to interpret RTP timestamps.
    pub clock_rate: u32,
    /// Largest RTP payload (RTP header excluded) the packetizer may emit.
    pub max_packet_payload_size: usize,
    /// How often the sender emits a heartbeat while preparing or connected.
    pub keep_alive_interval: Duration,
    /// A receiver fails the session after this long without any inbound message.
    pub receive_timeout: Duration,
    /// Received datagrams a session may hold before new ones are dropped.
    pub receive_queue_capacity: usize,
    /// Presentation clock tuning for the receiver role.
    pub clock: ClockConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            payload_type: DEFAULT_PAYLOAD_TYPE,
            clock_rate: VIDEO_CLOCK_RATE,
            max_packet_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            keep_alive_interval: Duration::from_secs(1),
            receive_timeout: Duration::from_secs(10),
            receive_queue_capacity: 1024,
            clock: ClockConfig::default(),
        }
    }
}

/// Tuning for [`PresentationClock`](crate::media::clock::PresentationClock).
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Lead time given to the decoder and renderer.
    pub lookahead: Duration,
    /// Weight of each new sample in the delay filter (0..=1).
    pub smoothing_factor: f64,
    /// Offset jump beyond which the remote clock is considered reset.
    pub resync_threshold: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            lookahead: Duration::from_millis(16),
            smoothing_factor: 0.05,
            resync_threshold: Duration::from_secs(1),
        }
    }
}
