//! Media framing and timing.
//!
//! This module turns encoded H.264 access units into RTP packets and back,
//! and maps remote RTP timestamps onto the local clock.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded video frame is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): for reordering and loss detection
//!   ([`sequence`]).
//! - **Timestamp** (32-bit): media clock, typically 90 kHz for video
//!   ([`clock`]).
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit (frame).
//!
//! ## Payload format
//!
//! | Direction | Module | RFC | Modes |
//! |-----------|--------|-----|-------|
//! | Send | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | Single NAL Unit, FU-A |
//! | Receive | [`depacketizer`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | Single NAL Unit, FU-A |
//!
//! Aggregation packets (STAP/MTAP) and interleaved mode are not handled.

pub mod clock;
pub mod decode_config;
pub mod depacketizer;
pub mod h264;
pub mod nal;
pub mod rtp;
pub mod sequence;

pub use clock::PresentationClock;
pub use decode_config::{DecodeConfiguration, ParameterSets};
pub use depacketizer::Depacketizer;
pub use h264::{H264Packetizer, extract_nal_units};
pub use nal::{NalHeader, NalUnit, NalUnitType};
pub use rtp::RtpHeader;
pub use sequence::{Continuity, SequenceTracker};
