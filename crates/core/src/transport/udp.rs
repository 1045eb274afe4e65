use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use super::{EventSink, Message, Transport, TransportEvent};
use crate::error::Result;

/// How often blocked receive loops check their running flag.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Largest datagram a receive loop accepts.
pub(crate) const MAX_DATAGRAM_SIZE: usize = 65_535;

/// UDP transport for a sending session.
///
/// Binds a local socket and connects it to the peer, so the kernel filters
/// inbound datagrams to that peer and surfaces ICMP errors (e.g. port
/// unreachable) as receive failures. A reader thread forwards inbound
/// datagrams to the session and polls a running flag every 50ms so that
/// [`cancel`](Transport::cancel) takes effect promptly.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    events: EventSink,
    running: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Bind a socket on `bind_addr` for traffic with `peer`.
    pub fn bind(bind_addr: &str, peer: SocketAddr, events: EventSink) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        Ok(Self {
            socket: Arc::new(socket),
            peer,
            events,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<()> {
        self.socket.connect(self.peer)?;
        self.running.store(true, Ordering::SeqCst);

        let socket = self.socket.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let peer = self.peer;
        thread::Builder::new()
            .name(format!("udp-recv-{peer}"))
            .spawn(move || receive_loop(socket, events, running, peer))?;

        tracing::info!(%peer, local = ?self.socket.local_addr().ok(), "UDP path connected");
        self.events.post(TransportEvent::Ready)
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.socket.send(payload)?;
        Ok(())
    }

    fn cancel(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::debug!(peer = %self.peer, "UDP transport cancelled");
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn receive_loop(socket: Arc<UdpSocket>, events: EventSink, running: Arc<AtomicBool>, peer: SocketAddr) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while running.load(Ordering::SeqCst) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                let message = Message::from_datagram(buf[..n].to_vec());
                if events.post(TransportEvent::Received(message)).is_err() {
                    return;
                }
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(%peer, error = %e, "UDP receive failed");
                    let _ = events.post(TransportEvent::Failed(e.to_string()));
                }
                return;
            }
        }
    }
    let _ = events.post(TransportEvent::Cancelled);
    tracing::debug!(%peer, "receive loop exited");
}

/// One remote peer of a [`Listener`](crate::Listener).
///
/// Outbound datagrams go through the listener's shared socket; inbound
/// ones are demultiplexed by the listener and delivered to the session
/// directly, so this side has no reader of its own.
pub struct PeerTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    events: EventSink,
}

impl PeerTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, events: EventSink) -> Self {
        Self {
            socket,
            peer,
            events,
        }
    }
}

impl Transport for PeerTransport {
    /// The listener socket is already bound, so the path is ready at once.
    fn connect(&mut self) -> Result<()> {
        self.events.post(TransportEvent::Ready)
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.socket.send_to(payload, self.peer)?;
        Ok(())
    }

    fn cancel(&mut self) {
        tracing::debug!(peer = %self.peer, "peer transport released");
    }
}
