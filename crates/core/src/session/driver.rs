//! Runs a [`Session`] on its own thread.
//!
//! Every input to the session (transport events, outbound media,
//! cancellation) is queued on one channel and applied in arrival order by a
//! single loop, which also sleeps until the session's next timer.
//!
//! The channel is bounded. Received datagrams beyond
//! [`SessionConfig::receive_queue_capacity`] are dropped at the sink and
//! counted; control commands wait for room in a reserve kept for them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::{Role, Session, SessionDelegate, SessionState, SessionStats};
use crate::config::SessionConfig;
use crate::error::{Result, StreamError};
use crate::media::nal::NalUnit;
use crate::transport::{Backlog, EventSink, Transport, TransportEvent, UdpTransport};

/// Queue slots kept for control commands and outbound media on top of the
/// received datagram quota.
const CONTROL_RESERVE: usize = 64;

/// Work queued for a session's thread.
#[derive(Debug)]
pub enum Command {
    Transport(TransportEvent),
    SendAnnexB { data: Vec<u8>, pts: Duration },
    SendUnits { units: Vec<NalUnit<'static>>, pts: Duration },
    Cancel,
}

/// Owner's handle to a running session.
///
/// Dropping the handle cancels the session.
pub struct SessionHandle {
    events: EventSink,
    state: Arc<RwLock<SessionState>>,
    thread: Option<JoinHandle<SessionStats>>,
}

impl SessionHandle {
    /// Build a transport wired to a new session, then start the session on
    /// a dedicated thread.
    pub fn spawn<T, D, F>(role: Role, config: SessionConfig, make_transport: F, delegate: D) -> Result<Self>
    where
        T: Transport + 'static,
        D: SessionDelegate + 'static,
        F: FnOnce(EventSink) -> Result<T>,
    {
        let capacity = config.receive_queue_capacity.max(1);
        let (tx, rx) = mpsc::sync_channel(capacity + CONTROL_RESERVE);
        let backlog = Arc::new(Backlog::new(capacity));
        let events = EventSink::new(tx, backlog.clone());
        let transport = make_transport(events.clone())?;
        let session = Session::new(role, config, transport, delegate);

        let state = Arc::new(RwLock::new(SessionState::Setup));
        let published = state.clone();
        let thread = thread::Builder::new()
            .name(format!("session-{role:?}").to_lowercase())
            .spawn(move || run(session, rx, &backlog, published))?;

        Ok(Self {
            events,
            state,
            thread: Some(thread),
        })
    }

    /// A session over a fresh UDP socket bound on `bind_addr` and connected to `peer`.
    pub fn connect_udp<D>(
        role: Role,
        bind_addr: &str,
        peer: SocketAddr,
        config: SessionConfig,
        delegate: D,
    ) -> Result<Self>
    where
        D: SessionDelegate + 'static,
    {
        Self::spawn(
            role,
            config,
            |events| UdpTransport::bind(bind_addr, peer, events),
            delegate,
        )
    }

    /// Last state published by the session thread.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Sink for injecting transport events from outside the session.
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    /// Inject a transport event. A received datagram is dropped, not
    /// queued, when the session is already holding its quota.
    pub fn deliver(&self, event: TransportEvent) -> Result<()> {
        self.events.post(event)
    }

    /// Queue an Annex B encoded frame for sending.
    pub fn send_annex_b(&self, data: Vec<u8>, pts: Duration) -> Result<()> {
        self.ensure_connected()?;
        self.events.command(Command::SendAnnexB { data, pts })
    }

    /// Queue the NAL units of one access unit for sending.
    pub fn send_units(&self, units: Vec<NalUnit<'static>>, pts: Duration) -> Result<()> {
        self.ensure_connected()?;
        self.events.command(Command::SendUnits { units, pts })
    }

    pub fn cancel(&self) {
        let _ = self.events.command(Command::Cancel);
    }

    /// Wait for the session thread to finish and collect its counters.
    ///
    /// Blocks until the session reaches a terminal state.
    pub fn join(mut self) -> Option<SessionStats> {
        self.thread.take().and_then(|t| t.join().ok())
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            state if state.is_terminal() => Err(StreamError::SessionClosed),
            state => Err(StreamError::NotConnected(state)),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.events.command(Command::Cancel);
    }
}

fn run<T, D>(
    mut session: Session<T, D>,
    commands: mpsc::Receiver<Command>,
    backlog: &Backlog,
    state: Arc<RwLock<SessionState>>,
) -> SessionStats
where
    T: Transport,
    D: SessionDelegate,
{
    session.start(Instant::now());
    *state.write() = session.state();

    while !session.state().is_terminal() {
        let now = Instant::now();
        let received = match session.poll_timeout() {
            Some(deadline) if deadline <= now => {
                session.handle_timeout(now);
                *state.write() = session.state();
                continue;
            }
            Some(deadline) => commands.recv_timeout(deadline - now),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        let now = Instant::now();
        if matches!(received, Ok(Command::Transport(TransportEvent::Received(_)))) {
            backlog.release();
        }
        session.record_queue_overflow(backlog.take_dropped());
        match received {
            Ok(command) => apply(&mut session, command, now),
            Err(RecvTimeoutError::Timeout) => session.handle_timeout(now),
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!("session handle gone");
                session.cancel();
            }
        }
        *state.write() = session.state();
    }

    session.record_queue_overflow(backlog.take_dropped());
    session.stats().clone()
}

fn apply<T, D>(session: &mut Session<T, D>, command: Command, now: Instant)
where
    T: Transport,
    D: SessionDelegate,
{
    let sent = match command {
        Command::Transport(event) => {
            session.handle_transport_event(event, now);
            return;
        }
        Command::Cancel => {
            session.cancel();
            return;
        }
        Command::SendAnnexB { data, pts } => session.send_annex_b(&data, pts),
        Command::SendUnits { units, pts } => session.send_access_unit(&units, pts),
    };
    if let Err(e) = sent {
        tracing::warn!(error = %e, "access unit not sent");
    }
}
