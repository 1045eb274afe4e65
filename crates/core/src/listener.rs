//! Accepts inbound streams on one UDP socket.
//!
//! Datagrams are demultiplexed by source address. The first datagram from
//! an unknown peer creates a receiving [`Session`](crate::Session) for it,
//! with a delegate produced by the caller's [`SessionFactory`]. Sessions
//! that reach a terminal state are pruned; if the same peer starts sending
//! again it gets a fresh session.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::RwLock;

use crate::config::SessionConfig;
use crate::error::{Result, StreamError};
use crate::session::{Role, SessionDelegate, SessionHandle};
use crate::transport::udp::{MAX_DATAGRAM_SIZE, POLL_INTERVAL};
use crate::transport::{Message, PeerTransport, TransportEvent};

/// Produces the delegate for each new inbound session.
pub trait SessionFactory: Send + Sync + 'static {
    type Delegate: SessionDelegate + 'static;

    fn create(&self, peer: SocketAddr) -> Self::Delegate;
}

impl<F, D> SessionFactory for F
where
    F: Fn(SocketAddr) -> D + Send + Sync + 'static,
    D: SessionDelegate + 'static,
{
    type Delegate = D;

    fn create(&self, peer: SocketAddr) -> D {
        self(peer)
    }
}

type PeerMap = Arc<RwLock<HashMap<SocketAddr, SessionHandle>>>;

/// UDP listener creating one receiving session per remote peer.
pub struct Listener<F: SessionFactory> {
    bind_addr: String,
    config: SessionConfig,
    factory: Arc<F>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    peers: PeerMap,
}

impl<F: SessionFactory> Listener<F> {
    pub fn new(bind_addr: &str, config: SessionConfig, factory: F) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            config,
            factory: Arc::new(factory),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind the socket and start the receive loop. Returns the bound address.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.load(Ordering::SeqCst) {
            return Err(StreamError::AlreadyRunning);
        }

        let socket = UdpSocket::bind(&self.bind_addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let local_addr = socket.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        self.local_addr = Some(local_addr);

        let dispatcher = Dispatcher {
            socket: Arc::new(socket),
            config: self.config.clone(),
            factory: self.factory.clone(),
            peers: self.peers.clone(),
            running: self.running.clone(),
        };

        tracing::info!(addr = %local_addr, "listening for streams");

        thread::Builder::new()
            .name(format!("listener-{local_addr}"))
            .spawn(move || dispatcher.run())?;

        Ok(local_addr)
    }

    /// Stop receiving and cancel every peer session.
    ///
    /// No session is opened once this returns, even for a datagram the
    /// receive loop was already handling.
    pub fn stop(&mut self) {
        let count = {
            let mut peers = self.peers.write();
            if !self.running.swap(false, Ordering::SeqCst) {
                return;
            }
            let count = peers.len();
            peers.clear();
            count
        };
        tracing::info!(sessions = count, "listener stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(StreamError::NotStarted)
    }

    /// Number of peers with a session, including ones that ended but have
    /// not been pruned yet.
    pub fn session_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().keys().copied().collect()
    }
}

impl<F: SessionFactory> Drop for Listener<F> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Dispatcher<F: SessionFactory> {
    socket: Arc<UdpSocket>,
    config: SessionConfig,
    factory: Arc<F>,
    peers: PeerMap,
    running: Arc<AtomicBool>,
}

impl<F: SessionFactory> Dispatcher<F> {
    /// Receive loop. Checks `running` between datagrams and at least every
    /// poll interval; prunes ended sessions while idle.
    fn run(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, peer)) => self.dispatch(peer, buf[..n].to_vec()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    self.prune();
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        tracing::warn!(error = %e, "UDP receive error");
                    }
                }
            }
        }
        tracing::debug!("listener loop exited");
    }

    fn dispatch(&self, peer: SocketAddr, datagram: Vec<u8>) {
        let mut peers = self.peers.write();
        // `stop` flips the flag under this lock.
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        if peers.get(&peer).is_some_and(|h| h.state().is_terminal()) {
            tracing::debug!(%peer, "replacing ended session");
            peers.remove(&peer);
        }

        let handle = match peers.entry(peer) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => match self.open(peer) {
                Ok(handle) => entry.insert(handle),
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "could not open session");
                    return;
                }
            },
        };

        let message = Message::from_datagram(datagram);
        if let Err(e) = handle.deliver(TransportEvent::Received(message)) {
            tracing::debug!(%peer, error = %e, "datagram dropped");
        }
    }

    fn open(&self, peer: SocketAddr) -> Result<SessionHandle> {
        let delegate = self.factory.create(peer);
        let socket = self.socket.clone();
        let handle = SessionHandle::spawn(
            Role::Receiver,
            self.config.clone(),
            |events| Ok(PeerTransport::new(socket, peer, events)),
            delegate,
        )?;
        tracing::info!(%peer, "new peer session");
        Ok(handle)
    }

    fn prune(&self) {
        let mut peers = self.peers.write();
        peers.retain(|peer, handle| {
            let ended = handle.state().is_terminal();
            if ended {
                tracing::info!(%peer, state = ?handle.state(), "peer session removed");
            }
            !ended
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::transport::KEEP_ALIVE;

    struct Discard;

    impl SessionDelegate for Discard {
        fn on_access_unit_ready(&mut self, _data: &[u8], _presentation_time: Instant) {}
    }

    fn listener(config: SessionConfig) -> Listener<impl SessionFactory> {
        Listener::new("127.0.0.1:0", config, |_peer: SocketAddr| Discard)
    }

    fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn start_and_stop() {
        let mut l = listener(SessionConfig::default());
        assert!(matches!(l.local_addr(), Err(StreamError::NotStarted)));

        let addr = l.start().unwrap();
        assert!(l.is_running());
        assert_eq!(l.local_addr().unwrap(), addr);
        assert!(matches!(l.start(), Err(StreamError::AlreadyRunning)));

        l.stop();
        assert!(!l.is_running());
    }

    #[test]
    fn one_session_per_peer() {
        let mut l = listener(SessionConfig::default());
        let addr = l.start().unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..3 {
            a.send_to(KEEP_ALIVE, addr).unwrap();
        }
        b.send_to(KEEP_ALIVE, addr).unwrap();

        eventually(|| l.session_count() == 2);
        let peers = l.peers();
        assert!(peers.contains(&a.local_addr().unwrap()));
        assert!(peers.contains(&b.local_addr().unwrap()));

        l.stop();
        assert_eq!(l.session_count(), 0);
    }

    #[test]
    fn no_sessions_after_stop() {
        let mut l = listener(SessionConfig::default());
        let addr = l.start().unwrap();
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.send_to(KEEP_ALIVE, addr).unwrap();
        eventually(|| l.session_count() == 1);

        l.stop();
        for _ in 0..20 {
            let _ = a.send_to(KEEP_ALIVE, addr);
        }
        thread::sleep(POLL_INTERVAL * 3);
        assert_eq!(l.session_count(), 0);
        assert!(l.peers().is_empty());
    }

    #[test]
    fn dispatch_after_stop_opens_nothing() {
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));
        let dispatcher = Dispatcher {
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            config: SessionConfig::default(),
            factory: Arc::new(|_peer: SocketAddr| Discard),
            peers: peers.clone(),
            running: Arc::new(AtomicBool::new(false)),
        };
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        dispatcher.dispatch(peer, KEEP_ALIVE.to_vec());
        assert!(peers.read().is_empty());

        dispatcher.running.store(true, Ordering::SeqCst);
        dispatcher.dispatch(peer, KEEP_ALIVE.to_vec());
        assert_eq!(peers.read().len(), 1);
        peers.write().clear();
    }

    #[test]
    fn silent_peer_is_pruned() {
        let config = SessionConfig {
            receive_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let mut l = listener(config);
        let addr = l.start().unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.send_to(KEEP_ALIVE, addr).unwrap();
        eventually(|| l.session_count() == 1);
        eventually(|| l.session_count() == 0);

        // Same peer again gets a new session.
        a.send_to(KEEP_ALIVE, addr).unwrap();
        eventually(|| l.session_count() == 1);
    }
}
