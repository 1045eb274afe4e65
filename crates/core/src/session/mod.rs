//! Per-connection session lifecycle.
//!
//! A session owns one transport connection carrying one media stream. It
//! is a plain state machine: every input (transport notifications,
//! received datagrams, timer expiry, outbound media) arrives through a
//! method call, and all of them are issued from a single execution context
//! (see [`driver`]), so the tracker, reassembly buffer and clock state need
//! no locking.
//!
//! ## Lifecycle
//!
//! ```text
//! Setup ──start──> Preparing ──ready──> Connected
//!                      │                    │
//!                      ├──failed/timeout────┼──> Failed    (terminal)
//!                      └──cancel────────────┴──> Canceled  (terminal)
//! ```
//!
//! `Canceled` can also be entered straight from `Setup` through an explicit
//! [`Session::cancel`]. Once terminal, every further input is ignored.

pub mod driver;

use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::error::{ProtocolErrorKind, Result, StreamError};
use crate::media::clock::PresentationClock;
use crate::media::decode_config::{DecodeConfiguration, ParameterSets};
use crate::media::depacketizer::Depacketizer;
use crate::media::h264::{H264Packetizer, extract_nal_units};
use crate::media::nal::{NalUnit, NalUnitType};
use crate::media::rtp::RtpHeader;
use crate::media::sequence::{Continuity, SequenceTracker};
use crate::transport::{KEEP_ALIVE, Message, Transport, TransportEvent};

pub use driver::SessionHandle;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, transport not started.
    Setup,
    /// Transport is connecting.
    Preparing,
    /// Transport is ready; media flows.
    Connected,
    /// Transport failure or timeout. Terminal.
    Failed,
    /// Explicitly cancelled. Terminal.
    Canceled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    /// Preparing or Connected: timers run and traffic is accepted.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Preparing | Self::Connected)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Setup, Preparing)
                | (Setup, Canceled)
                | (Preparing, Connected)
                | (Preparing, Failed)
                | (Preparing, Canceled)
                | (Connected, Failed)
                | (Connected, Canceled)
        )
    }
}

/// Which end of the stream this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Packetizes and sends access units; emits heartbeats.
    Sender,
    /// Reassembles and timestamps received units; watches for silence.
    Receiver,
}

/// Non-fatal conditions reported upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Sequence gap before `sequence`.
    Lost { sequence: u16, count: u16 },
    /// `sequence` was not newer than the previous packet.
    Reordered { sequence: u16 },
    /// The sender restarted with a new synchronization source.
    SsrcChanged { previous: u32, current: u32 },
    /// A packet was dropped as malformed.
    Protocol(ProtocolErrorKind),
    /// A picture arrived before any decode configuration and was dropped.
    NotReady { unit_type: NalUnitType },
}

/// Receives everything a session reports upward.
///
/// Callbacks run on the session's execution context and must not block.
pub trait SessionDelegate: Send {
    fn on_state_changed(&mut self, _state: SessionState) {}

    fn on_decode_configuration_ready(&mut self, _configuration: &DecodeConfiguration) {}

    /// A picture NAL unit (header byte included) and when to present it.
    fn on_access_unit_ready(&mut self, data: &[u8], presentation_time: Instant);

    fn on_anomaly(&mut self, _anomaly: &Anomaly) {}
}

/// Counters kept for the lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_reordered: u64,
    pub packets_malformed: u64,
    pub units_emitted: u64,
    pub units_dropped_not_ready: u64,
    pub keep_alives_received: u64,
    pub keep_alives_sent: u64,
    pub packets_sent: u64,
    pub send_failures: u64,
    /// Datagrams discarded because the session's receive queue was full.
    pub packets_dropped_queue_full: u64,
}

/// One connection's state machine. See the [module docs](self).
pub struct Session<T: Transport, D: SessionDelegate> {
    role: Role,
    config: SessionConfig,
    state: SessionState,
    transport: T,
    delegate: D,

    ssrc: Option<u32>,
    tracker: SequenceTracker,
    depacketizer: Depacketizer,
    clock: PresentationClock,
    parameter_sets: ParameterSets,

    packetizer: H264Packetizer,

    timeout_at: Option<Instant>,
    keep_alive_at: Option<Instant>,

    stats: SessionStats,
}

impl<T: Transport, D: SessionDelegate> Session<T, D> {
    pub fn new(role: Role, config: SessionConfig, transport: T, delegate: D) -> Self {
        let packetizer = H264Packetizer::with_random_ssrc(config.payload_type)
            .with_max_payload_size(config.max_packet_payload_size);
        let clock = PresentationClock::new(config.clock.clone());
        Self {
            role,
            config,
            state: SessionState::Setup,
            transport,
            delegate,
            ssrc: None,
            tracker: SequenceTracker::new(),
            depacketizer: Depacketizer::new(),
            clock,
            parameter_sets: ParameterSets::new(),
            packetizer,
            timeout_at: None,
            keep_alive_at: None,
            stats: SessionStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn decode_configuration(&self) -> Option<&DecodeConfiguration> {
        self.parameter_sets.configuration()
    }

    /// Begin connecting. Only valid from `Setup`.
    pub fn start(&mut self, now: Instant) {
        if self.state != SessionState::Setup {
            tracing::debug!(state = ?self.state, "start ignored");
            return;
        }
        self.transition(SessionState::Preparing);
        self.arm_timeout(now);
        if self.role == Role::Sender {
            self.keep_alive_at = Some(now + self.config.keep_alive_interval);
        }

        if let Err(e) = self.transport.connect() {
            self.fail(&format!("connect: {e}"));
        }
    }

    /// Explicit cancellation from any non-terminal state.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let started = self.state != SessionState::Setup;
        self.transition(SessionState::Canceled);
        if started {
            self.transport.cancel();
        }
    }

    /// Account for datagrams the driver discarded before they reached the
    /// session.
    pub(crate) fn record_queue_overflow(&mut self, dropped: u64) {
        if dropped == 0 {
            return;
        }
        self.stats.packets_dropped_queue_full += dropped;
        tracing::debug!(dropped, total = self.stats.packets_dropped_queue_full, "receive queue full");
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Ready => self.on_ready(now),
            TransportEvent::Failed(reason) => {
                if self.state.is_active() {
                    self.fail(&reason);
                }
            }
            TransportEvent::Cancelled => {
                if self.state.is_active() {
                    self.transition(SessionState::Canceled);
                }
            }
            TransportEvent::Received(message) => self.on_message(message, now),
        }
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout) has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if !self.state.is_active() {
            return None;
        }
        match (self.timeout_at, self.keep_alive_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire any timers due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if !self.state.is_active() {
            return;
        }

        if self.timeout_at.is_some_and(|at| at <= now) {
            tracing::warn!(
                timeout_ms = self.config.receive_timeout.as_millis() as u64,
                "no traffic, session timed out"
            );
            self.fail("receive timeout");
            return;
        }

        if self.keep_alive_at.is_some_and(|at| at <= now) {
            self.send_keep_alive();
            self.keep_alive_at = Some(now + self.config.keep_alive_interval);
        }
    }

    /// Packetize and send one access unit as a single batch.
    ///
    /// `pts` is converted to media clock ticks and wraps like any RTP
    /// timestamp. Returns the number of packets handed to the transport.
    pub fn send_access_unit(&mut self, units: &[NalUnit<'_>], pts: Duration) -> Result<usize> {
        if self.state != SessionState::Connected {
            return Err(StreamError::NotConnected(self.state));
        }

        let timestamp = media_ticks(pts, self.config.clock_rate);
        let packets = self.packetizer.packetize(units, timestamp)?;
        let sent = self.transport.send_batch(&packets);

        self.stats.packets_sent += sent as u64;
        self.stats.send_failures += (packets.len() - sent) as u64;
        tracing::trace!(packets = packets.len(), sent, timestamp, "access unit sent");
        Ok(sent)
    }

    /// Send one encoded frame given as an Annex B byte stream.
    ///
    /// The NAL units are borrowed straight out of `data`.
    pub fn send_annex_b(&mut self, data: &[u8], pts: Duration) -> Result<usize> {
        let units = extract_nal_units(data)
            .into_iter()
            .map(NalUnit::parse)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.send_access_unit(&units, pts)
    }

    fn on_ready(&mut self, now: Instant) {
        if self.state != SessionState::Preparing {
            tracing::trace!(state = ?self.state, "ready ignored");
            return;
        }
        self.transition(SessionState::Connected);
        self.arm_timeout(now);
        if self.role == Role::Sender {
            // Prime the path so the far end learns about us before media.
            self.send_keep_alive();
            self.keep_alive_at = Some(now + self.config.keep_alive_interval);
        }
    }

    fn on_message(&mut self, message: Message, now: Instant) {
        if !self.state.is_active() {
            return;
        }
        self.arm_timeout(now);

        match message {
            Message::KeepAlive => {
                self.stats.keep_alives_received += 1;
                tracing::trace!("keep-alive received");
            }
            Message::Media(packet) => match self.role {
                Role::Receiver => self.receive_packet(&packet, now),
                Role::Sender => tracing::trace!(size = packet.len(), "media ignored by sender"),
            },
        }
    }

    fn receive_packet(&mut self, packet: &[u8], now: Instant) {
        let (header, payload) = match RtpHeader::parse(packet) {
            Ok(parsed) => parsed,
            Err(e) => return self.drop_malformed(e),
        };
        self.stats.packets_received += 1;

        if let Some(previous) = self.ssrc.filter(|&ssrc| ssrc != header.ssrc) {
            tracing::info!(
                previous = format_args!("{:#010X}", previous),
                current = format_args!("{:#010X}", header.ssrc),
                "SSRC changed, resynchronizing"
            );
            self.tracker.reset();
            self.depacketizer.reset();
            self.clock.reset();
            self.report(Anomaly::SsrcChanged {
                previous,
                current: header.ssrc,
            });
        }
        self.ssrc = Some(header.ssrc);

        let sequence = header.sequence_number;
        match self.tracker.track(sequence) {
            Continuity::InOrder => {}
            Continuity::Lost(count) => {
                tracing::debug!(sequence, count, "packet loss");
                self.stats.packets_lost += u64::from(count);
                self.depacketizer.reset();
                self.report(Anomaly::Lost { sequence, count });
            }
            Continuity::Reordered => {
                tracing::debug!(sequence, "packet reordered");
                self.stats.packets_reordered += 1;
                self.depacketizer.reset();
                self.report(Anomaly::Reordered { sequence });
            }
        }

        match self.depacketizer.receive(&header, payload) {
            Ok(units) => {
                for unit in units {
                    self.handle_unit(&header, unit, now);
                }
            }
            Err(e) => self.drop_malformed(e),
        }
    }

    fn handle_unit(&mut self, header: &RtpHeader, unit: NalUnit<'static>, now: Instant) {
        let unit_type = unit.unit_type();

        if matches!(unit_type, NalUnitType::Sps | NalUnitType::Pps) {
            let change = self.parameter_sets.apply(&unit);
            if let Some(config) = change.and_then(|c| self.parameter_sets.recompute(c)) {
                tracing::info!(
                    profile_level_id = config.profile_level_id().as_deref().unwrap_or("?"),
                    "decode configuration ready"
                );
                self.delegate.on_decode_configuration_ready(config);
            }
            return;
        }

        if !unit_type.is_vcl() {
            tracing::trace!(?unit_type, "non-picture unit skipped");
            return;
        }

        if self.parameter_sets.configuration().is_none() {
            tracing::debug!(?unit_type, "picture before decode configuration, dropped");
            self.stats.units_dropped_not_ready += 1;
            self.report(Anomaly::NotReady { unit_type });
            return;
        }

        let presentation = self.clock.observe(header.timestamp, self.config.clock_rate, now);
        self.stats.units_emitted += 1;
        self.delegate
            .on_access_unit_ready(&unit.to_bytes(), presentation);
    }

    fn drop_malformed(&mut self, error: StreamError) {
        self.stats.packets_malformed += 1;
        match error {
            StreamError::Protocol { kind } => {
                tracing::debug!(%kind, "malformed packet dropped");
                self.report(Anomaly::Protocol(kind));
            }
            other => tracing::warn!(error = %other, "packet dropped"),
        }
    }

    fn send_keep_alive(&mut self) {
        match self.transport.send(KEEP_ALIVE) {
            Ok(()) => {
                self.stats.keep_alives_sent += 1;
                tracing::trace!("keep-alive sent");
            }
            Err(e) => tracing::debug!(error = %e, "keep-alive send failed"),
        }
    }

    fn arm_timeout(&mut self, now: Instant) {
        if self.role == Role::Receiver {
            self.timeout_at = Some(now + self.config.receive_timeout);
        }
    }

    fn fail(&mut self, reason: &str) {
        tracing::warn!(reason, "session failed");
        self.transition(SessionState::Failed);
        self.transport.cancel();
    }

    fn report(&mut self, anomaly: Anomaly) {
        self.delegate.on_anomaly(&anomaly);
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            tracing::debug!(from = ?self.state, to = ?next, "transition refused");
            return;
        }
        tracing::debug!(old_state = ?self.state, new_state = ?next, role = ?self.role, "state transition");
        self.state = next;
        if next.is_terminal() {
            self.timeout_at = None;
            self.keep_alive_at = None;
            tracing::info!(state = ?next, stats = ?self.stats, "session ended");
        }
        self.delegate.on_state_changed(next);
    }
}

/// Convert a presentation time to RTP media clock ticks (mod 2^32).
pub fn media_ticks(pts: Duration, clock_rate: u32) -> u32 {
    (pts.as_nanos() * u128::from(clock_rate) / 1_000_000_000) as u32
}
