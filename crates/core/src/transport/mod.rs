//! Datagram transport underneath a session.
//!
//! A [`Transport`] moves whole datagrams between the two endpoints. It is
//! driven from the session's execution context, and reports asynchronous
//! state (readiness, failure, cancellation, received messages) back into
//! that same context through an [`EventSink`].
//!
//! - [`udp::UdpTransport`]: a connected socket owned by one sending session.
//! - [`udp::PeerTransport`]: one peer of a [`Listener`](crate::Listener),
//!   sharing the listener's socket.
//!
//! Heartbeats and RTP share the channel. A heartbeat is the fixed payload
//! [`KEEP_ALIVE`], whose first byte can never start a version-2 RTP header.

pub mod udp;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, TrySendError};

use crate::error::{Result, StreamError};
use crate::session::driver::Command;

pub use udp::{PeerTransport, UdpTransport};

/// Heartbeat payload.
pub const KEEP_ALIVE: &[u8] = b"keep-alive";

/// An application-level datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An RTP packet.
    Media(Vec<u8>),
    KeepAlive,
}

impl Message {
    pub fn from_datagram(data: Vec<u8>) -> Self {
        if data == KEEP_ALIVE {
            Self::KeepAlive
        } else {
            Self::Media(data)
        }
    }
}

/// Asynchronous notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The path is usable.
    Ready,
    /// The path broke; the session cannot continue.
    Failed(String),
    /// The transport was closed on request.
    Cancelled,
    Received(Message),
}

/// Handle a transport uses to post events into its session's context.
///
/// The session's queue is bounded. Received datagrams are offered without
/// waiting and dropped when the session already holds its quota of them;
/// the gap then shows up as sequence loss. Every other event waits for room.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::SyncSender<Command>,
    backlog: Arc<Backlog>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::SyncSender<Command>, backlog: Arc<Backlog>) -> Self {
        Self { tx, backlog }
    }

    /// Queue an event. Fails once the session's context has exited.
    ///
    /// A received datagram that does not fit is counted and discarded, which
    /// is not an error.
    pub fn post(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Received(message) => self.offer(message),
            event => self.command(Command::Transport(event)),
        }
    }

    /// Queue a control command, waiting for room if needed.
    pub(crate) fn command(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| StreamError::SessionClosed)
    }

    #[cfg(test)]
    pub(crate) fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    fn offer(&self, message: Message) -> Result<()> {
        if !self.backlog.admit() {
            tracing::trace!("session backlog full, datagram dropped");
            return Ok(());
        }
        match self
            .tx
            .try_send(Command::Transport(TransportEvent::Received(message)))
        {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.backlog.release();
                self.backlog.record_drop();
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                self.backlog.release();
                Err(StreamError::SessionClosed)
            }
        }
    }
}

/// Accounting for received datagrams waiting in a session's queue.
///
/// The queue itself has room for `capacity` datagrams plus a small reserve,
/// so control events always find a slot even when media has filled its share.
#[derive(Debug)]
pub(crate) struct Backlog {
    capacity: usize,
    queued: AtomicUsize,
    dropped: AtomicU64,
}

impl Backlog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queued: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Reserve a slot for one datagram, or count it as dropped.
    fn admit(&self) -> bool {
        let admitted = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.record_drop();
        }
        admitted
    }

    /// A queued datagram was taken off the queue.
    pub(crate) fn release(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Drops since the last call.
    pub(crate) fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::SeqCst)
    }
}

/// Datagram delivery used by a [`Session`](crate::session::Session).
pub trait Transport: Send {
    /// Start establishing the path. Readiness is reported later as
    /// [`TransportEvent::Ready`]; an immediate error fails the session.
    fn connect(&mut self) -> Result<()>;

    /// Send one datagram.
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Send the packets of one access unit together.
    ///
    /// Each packet completes on its own: a failure is logged and the rest
    /// of the batch is still sent. Returns how many were sent.
    fn send_batch(&mut self, batch: &[Vec<u8>]) -> usize {
        let mut sent = 0;
        for (i, packet) in batch.iter().enumerate() {
            match self.send(packet) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(index = i, batch = batch.len(), error = %e, "packet send failed")
                }
            }
        }
        sent
    }

    /// Close the path. Late events after this are ignored by the session.
    fn cancel(&mut self);
}
