//! RTP transport for live H.264 video.
//!
//! A [`Session`] carries one stream between two endpoints: the sender
//! packetizes access units into RTP (single NAL unit or FU-A), the receiver
//! reassembles them, detects loss and reordering, derives the decoder
//! configuration from SPS/PPS, and maps RTP timestamps onto local
//! presentation times. [`SessionHandle`] runs a session on its own thread;
//! [`Listener`] accepts any number of inbound streams on one UDP port.

pub mod config;
pub mod error;
pub mod listener;
pub mod media;
pub mod session;
pub mod transport;

pub use config::{ClockConfig, SessionConfig};
pub use error::{FramingError, ProtocolErrorKind, Result, StreamError};
pub use listener::{Listener, SessionFactory};
pub use media::{DecodeConfiguration, H264Packetizer, NalUnit, NalUnitType, PresentationClock};
pub use session::{
    Anomaly, Role, Session, SessionDelegate, SessionHandle, SessionState, SessionStats,
};
pub use transport::{Transport, TransportEvent};
