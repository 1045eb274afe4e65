//! Error types for the streaming engine.

use std::fmt;

use crate::session::SessionState;

/// Errors that can occur in the streaming engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Wire**: [`Protocol`](Self::Protocol), malformed RTP packets or
///   broken fragment sequences. Never fatal to a session.
/// - **Framing**: [`Framing`](Self::Framing), an access unit could not be
///   split into packets.
/// - **Transport**: [`Io`](Self::Io), socket/network failures.
/// - **Session**: [`NotConnected`](Self::NotConnected),
///   [`SessionClosed`](Self::SessionClosed).
/// - **Listener**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A received packet could not be interpreted.
    #[error("protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// An outbound access unit could not be packetized.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Media was submitted while the session was not in the `Connected` state.
    #[error("session not connected (state: {0:?})")]
    NotConnected(SessionState),

    /// The session's execution context has already exited.
    #[error("session closed")]
    SessionClosed,

    /// [`Listener::start`](crate::Listener::start) has not been called yet.
    #[error("listener not started")]
    NotStarted,

    /// [`Listener::start`](crate::Listener::start) was called while already running.
    #[error("listener already running")]
    AlreadyRunning,
}

impl From<ProtocolErrorKind> for StreamError {
    fn from(kind: ProtocolErrorKind) -> Self {
        Self::Protocol { kind }
    }
}

/// Specific kind of inbound protocol failure.
///
/// All of these are local and recoverable: the offending packet is dropped,
/// in-flight reassembly is discarded, and the session continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Datagram shorter than the 12-byte RTP fixed header.
    TooShort,
    /// RTP version field was not 2.
    BadVersion(u8),
    /// CSRC list, header extension or padding ran past the end of the datagram.
    TruncatedPayload,
    /// RTP packet carried no payload bytes.
    EmptyPayload,
    /// A continuation or end fragment did not directly follow the previous one.
    FragmentGap { expected: u16, got: u16 },
    /// A continuation or end fragment arrived with no open reassembly buffer.
    OrphanFragment,
    /// Fragmentation header had both start and end bits set.
    InvalidFragmentHeader,
    /// Aggregation or interleaved packet types are not handled.
    UnsupportedPacketization(u8),
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "packet shorter than RTP header"),
            Self::BadVersion(v) => write!(f, "unsupported RTP version {v}"),
            Self::TruncatedPayload => write!(f, "truncated payload"),
            Self::EmptyPayload => write!(f, "empty payload"),
            Self::FragmentGap { expected, got } => {
                write!(f, "fragment gap (expected seq {expected}, got {got})")
            }
            Self::OrphanFragment => write!(f, "fragment without start"),
            Self::InvalidFragmentHeader => write!(f, "fragment header has start and end set"),
            Self::UnsupportedPacketization(t) => {
                write!(f, "unsupported packetization type {t}")
            }
        }
    }
}

/// Errors raised while splitting NAL units into packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The NAL unit has a header byte but no payload.
    #[error("NAL unit has no payload")]
    EmptyUnit,
    /// No NAL units were supplied for an access unit.
    #[error("access unit contains no NAL units")]
    EmptyAccessUnit,
    /// A zero-length buffer cannot carry a NAL unit header.
    #[error("NAL unit header missing")]
    MissingHeader,
    /// The packet payload limit cannot fit a fragmentation header plus one byte.
    #[error("max packet payload size {max} too small for fragmentation")]
    PayloadSizeTooSmall { max: usize },
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
