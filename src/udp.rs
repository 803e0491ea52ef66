//! UDP relay server
//!
//! Datagrams are relayed per client (IP, port) tuple: each tuple gets a
//! lazily created session with its own outbound socket. Sessions either
//! stick to one selected target or, in broadcast mode, copy datagrams to
//! every target until a reply source is pinned. Blocked sends are queued on
//! a per-session FIFO backlog drained by a writable-driven flush task, and a
//! periodic sweep reaps sessions that are done or idle.

use crate::config::UdpRelayConfig;
use crate::target::TargetSelector;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum UDP datagram size
const MAX_DATAGRAM: usize = 65535;

/// Upper bound for the reap sweep period
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The UDP relay: listening socket, session table and reap sweep
pub struct UdpRelayServer {
    config: UdpRelayConfig,
    selector: TargetSelector,
    socket: Arc<UdpSocket>,
    sessions: Arc<RwLock<HashMap<SocketAddr, SessionHandle>>>,
}

struct SessionHandle {
    session: Arc<Mutex<UdpRelaySession>>,
    pump: Option<JoinHandle<()>>,
}

impl UdpRelayServer {
    /// Build the selector and bind the listening socket
    pub async fn bind(config: UdpRelayConfig) -> Result<Self> {
        let selector = TargetSelector::new(config.common.targets.clone(), config.common.strategy)?;
        let socket = UdpSocket::bind(config.common.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.common.bind))?;

        Ok(UdpRelayServer {
            config,
            selector,
            socket: Arc::new(socket),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run the datagram/dispatch loop until the shutdown channel fires.
    ///
    /// The sweep tick doubles as the bounded housekeeping poll: backlogs are
    /// flushed and expired sessions reaped even when no traffic arrives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<bool>) -> Result<()> {
        info!(
            "UDP relay listening on {} ({} target(s), {:?}, broadcast: {}, replies: {})",
            self.local_addr()?,
            self.selector.len(),
            self.config.common.strategy,
            self.config.broadcast,
            !self.config.no_reply,
        );
        if self.config.common.filter.allow_count() + self.config.common.filter.deny_count() > 0 {
            info!("Address filter: {}", self.config.common.filter.describe());
        }

        let period = self.config.session_timeout.min(SWEEP_INTERVAL);
        let mut sweep = tokio::time::interval(period);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => self.handle_datagram(&buf[..len], peer).await,
                        Err(e) => warn!("UDP recv failed: {}", e),
                    }
                }
                _ = sweep.tick() => self.sweep().await,
                _ = shutdown.recv() => {
                    info!("UDP relay shutting down");
                    break;
                }
            }
        }

        // Unconditional teardown of every session
        let mut sessions = self.sessions.write().await;
        for (_, handle) in sessions.drain() {
            if let Some(pump) = handle.pump {
                pump.abort();
            }
        }
        Ok(())
    }

    /// Route one client datagram to its session, creating it if needed
    async fn handle_datagram(&self, payload: &[u8], peer: SocketAddr) {
        let existing = self
            .sessions
            .read()
            .await
            .get(&peer)
            .map(|h| h.session.clone());

        let session = match existing {
            Some(session) => session,
            None => {
                if !self.config.common.filter.admit(peer.ip()) {
                    debug!("Rejected datagram from {}", peer);
                    return;
                }
                match self.create_session(peer).await {
                    Ok(session) => session,
                    Err(e) => {
                        debug!("Failed to create session for {}: {:#}", peer, e);
                        return;
                    }
                }
            }
        };

        let mut guard = session.lock().await;
        guard.forward(payload);
        spawn_flusher(&session, &mut guard);
    }

    async fn create_session(&self, peer: SocketAddr) -> Result<Arc<Mutex<UdpRelaySession>>> {
        let destinations: Vec<SocketAddr> = if self.config.broadcast {
            self.selector.all().iter().map(|t| t.addr).collect()
        } else {
            vec![self.selector.pick().addr]
        };

        let session = UdpRelaySession::new(peer, self.socket.clone(), destinations).await?;
        let outbound = session.socket.clone();
        let session = Arc::new(Mutex::new(session));

        let pump = if self.config.no_reply {
            None
        } else {
            Some(tokio::spawn(pump_replies(session.clone(), outbound)))
        };

        debug!("UDP session created for {}", peer);
        self.sessions.write().await.insert(
            peer,
            SessionHandle {
                session: session.clone(),
                pump,
            },
        );
        Ok(session)
    }

    /// Flush backlogs and reap sessions that are done or idle
    async fn sweep(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        let mut expired = Vec::new();
        for (addr, handle) in sessions.iter() {
            let mut session = handle.session.lock().await;
            session.flush_backlog();
            spawn_flusher(&handle.session, &mut session);
            if session.should_reap(now, self.config.session_timeout) {
                expired.push(*addr);
            }
        }

        for addr in expired {
            if let Some(handle) = sessions.remove(&addr) {
                if let Some(pump) = handle.pump {
                    pump.abort();
                }
                debug!("Reaped UDP session for {}", addr);
            }
        }
    }
}

/// Per-client-tuple relay state.
///
/// Eligible for reaping only when the backlog is empty and the session is
/// either no longer running or idle past the timeout.
struct UdpRelaySession {
    client: SocketAddr,
    /// Dedicated outbound socket for this client tuple
    socket: Arc<UdpSocket>,
    /// Listening socket, used for client-bound sends
    server_socket: Arc<UdpSocket>,
    /// Reply sources accepted before pinning
    admissible: Vec<SocketAddr>,
    /// Pinned reply source, set by the first accepted reply
    reply_from: Option<SocketAddr>,
    /// Payloads waiting on a blocked send, FIFO
    backlog: VecDeque<(Bytes, SocketAddr)>,
    /// A writable-driven flush task is currently draining the backlog
    flushing: bool,
    last_activity: Instant,
    running: bool,
}

impl UdpRelaySession {
    async fn new(
        client: SocketAddr,
        server_socket: Arc<UdpSocket>,
        destinations: Vec<SocketAddr>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind outbound UDP socket")?;

        Ok(UdpRelaySession {
            client,
            socket: Arc::new(socket),
            server_socket,
            admissible: destinations,
            reply_from: None,
            backlog: VecDeque::new(),
            flushing: false,
            last_activity: Instant::now(),
            running: true,
        })
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Targets the next datagram goes to: the pinned reply source once one
    /// exists, otherwise every admissible destination
    fn destinations(&self) -> Vec<SocketAddr> {
        match self.reply_from {
            Some(pinned) => vec![pinned],
            None => self.admissible.clone(),
        }
    }

    /// Forward one client datagram, queueing on the backlog when a send
    /// would block.
    ///
    /// Queued payloads go out first: a datagram never overtakes one already
    /// waiting for the same destination.
    fn forward(&mut self, payload: &[u8]) {
        self.touch();
        self.flush_backlog();
        for dest in self.destinations() {
            if self.backlog.iter().any(|(_, queued)| *queued == dest) {
                self.backlog.push_back((Bytes::copy_from_slice(payload), dest));
                continue;
            }
            match self.socket.try_send_to(payload, dest) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.backlog.push_back((Bytes::copy_from_slice(payload), dest));
                }
                Err(e) => {
                    debug!("UDP send to {} failed: {}", dest, e);
                    self.running = false;
                }
            }
        }
    }

    /// Validate a reply source, pinning the first admissible one.
    ///
    /// First reply processed wins; replies from any other source are
    /// discarded as spoofed or stale.
    fn accept_reply(&mut self, from: SocketAddr) -> bool {
        match self.reply_from {
            Some(pinned) => pinned == from,
            None => {
                if self.admissible.contains(&from) {
                    debug!("Pinned reply source {} for client {}", from, self.client);
                    self.reply_from = Some(from);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Queue a client-bound payload after a blocked send
    fn queue_to_client(&mut self, payload: Bytes) {
        let client = self.client;
        self.backlog.push_back((payload, client));
    }

    /// Send a reply to the client, preserving FIFO order behind any payload
    /// already queued for it
    fn send_to_client(&mut self, payload: &[u8]) {
        self.flush_backlog();
        if self.backlog.iter().any(|(_, dest)| *dest == self.client) {
            self.queue_to_client(Bytes::copy_from_slice(payload));
            return;
        }
        match self.server_socket.try_send_to(payload, self.client) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.queue_to_client(Bytes::copy_from_slice(payload));
            }
            Err(e) => {
                debug!("UDP send to client {} failed: {}", self.client, e);
                self.running = false;
            }
        }
    }

    /// Flush queued datagrams in FIFO order until one would block again
    fn flush_backlog(&mut self) {
        while let Some((payload, dest)) = self.backlog.pop_front() {
            let socket = if dest == self.client {
                &self.server_socket
            } else {
                &self.socket
            };
            match socket.try_send_to(&payload, dest) {
                Ok(_) => self.touch(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.backlog.push_front((payload, dest));
                    break;
                }
                Err(e) => {
                    debug!("UDP backlog send to {} failed: {}", dest, e);
                    self.running = false;
                }
            }
        }
    }

    fn should_reap(&self, now: Instant, timeout: Duration) -> bool {
        self.backlog.is_empty()
            && (!self.running || now.duration_since(self.last_activity) > timeout)
    }
}

/// Receive replies on a session's outbound socket and forward accepted ones
/// to the client
async fn pump_replies(session: Arc<Mutex<UdpRelaySession>>, outbound: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match outbound.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let mut guard = session.lock().await;
                guard.touch();
                if !guard.accept_reply(from) {
                    debug!("Discarding reply from unexpected source {}", from);
                    continue;
                }
                guard.send_to_client(&buf[..len]);
                if !guard.running {
                    break;
                }
                spawn_flusher(&session, &mut guard);
            }
            Err(e) => {
                debug!("UDP reply recv failed: {}", e);
                session.lock().await.running = false;
                break;
            }
        }
    }
}

/// Start the flush task for a session with queued data, unless one is
/// already running
fn spawn_flusher(session: &Arc<Mutex<UdpRelaySession>>, guard: &mut UdpRelaySession) {
    if guard.backlog.is_empty() || guard.flushing {
        return;
    }
    guard.flushing = true;
    tokio::spawn(drain_backlog(session.clone()));
}

/// Wait for write readiness on whichever socket the oldest queued payload
/// needs, flush, and repeat until the backlog empties or the session stops
async fn drain_backlog(session: Arc<Mutex<UdpRelaySession>>) {
    loop {
        let socket = {
            let mut guard = session.lock().await;
            let next = match guard.backlog.front() {
                Some((_, dest)) if guard.running => Some(*dest),
                _ => None,
            };
            match next {
                Some(dest) if dest == guard.client => guard.server_socket.clone(),
                Some(_) => guard.socket.clone(),
                None => {
                    guard.flushing = false;
                    return;
                }
            }
        };
        if socket.writable().await.is_err() {
            session.lock().await.flushing = false;
            return;
        }
        session.lock().await.flush_backlog();
    }
}
