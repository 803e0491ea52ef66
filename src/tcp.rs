//! TCP relay server
//!
//! Accepts client connections, admits them through the address filter,
//! pairs each with an upstream target and relays bytes until either side
//! closes. Either leg can optionally carry TLS: termination on the client
//! leg, origination on the upstream leg.

use crate::config::TcpRelayConfig;
use crate::relay::{copy_legs, BoxedStream, SocketOpts};
use crate::target::{Target, TargetSelector};
use crate::tls;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Timeout for the upstream connect
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The TCP relay: listener, target selector and per-session dispatch
pub struct TcpRelayServer {
    config: TcpRelayConfig,
    selector: TargetSelector,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    listener: TcpListener,
    socket_opts: SocketOpts,
}

impl TcpRelayServer {
    /// Load TLS material, build the selector and bind the listening socket.
    ///
    /// A bind failure is fatal and reported to the caller before any event
    /// loop starts.
    pub async fn bind(config: TcpRelayConfig) -> Result<Self> {
        let acceptor = config
            .tls
            .as_ref()
            .map(tls::server_acceptor)
            .transpose()
            .context("Failed to load listening TLS material")?;
        let connector = tls::target_connector(config.target_tls)?;
        let selector = TargetSelector::new(config.common.targets.clone(), config.common.strategy)?;

        let listener = TcpListener::bind(config.common.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.common.bind))?;

        Ok(TcpRelayServer {
            config,
            selector,
            acceptor,
            connector,
            listener,
            socket_opts: SocketOpts::default(),
        })
    }

    /// Actual bound address (useful when binding port 0)
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept/dispatch loop until the shutdown channel fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<bool>) -> Result<()> {
        info!(
            "TCP relay listening on {} ({} target(s), {:?}, TLS in: {}, TLS out: {:?})",
            self.local_addr()?,
            self.selector.len(),
            self.config.common.strategy,
            self.acceptor.is_some(),
            self.config.target_tls,
        );
        if self.config.common.filter.allow_count() + self.config.common.filter.deny_count() > 0 {
            info!("Address filter: {}", self.config.common.filter.describe());
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.dispatch(stream, peer),
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("TCP relay shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Admit or reject one accepted connection and hand it to a session
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        if !self.config.common.filter.admit(peer.ip()) {
            debug!("Rejected connection from {}", peer);
            return;
        }

        let session = TcpRelaySession {
            peer,
            target: self.selector.pick(),
            acceptor: self.acceptor.clone(),
            connector: self.connector.clone(),
            socket_opts: self.socket_opts.clone(),
            chunk_size: self.config.chunk_size,
        };

        // Session failures stay inside the session task
        tokio::spawn(async move {
            let peer = session.peer;
            if let Err(e) = session.run(stream).await {
                debug!("Session {} ended with error: {:#}", peer, e);
            }
        });
    }
}

/// One accepted client paired with one upstream connection.
///
/// Data only flows once both legs are fully connected, TLS handshakes
/// included; any hard error on either leg ends the session, and dropping
/// the two streams closes and deregisters both sockets exactly once.
struct TcpRelaySession {
    peer: SocketAddr,
    target: Arc<Target>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    socket_opts: SocketOpts,
    chunk_size: usize,
}

impl TcpRelaySession {
    async fn run(self, client: TcpStream) -> Result<()> {
        debug!("Relay attempt {} -> {}", self.peer, self.target);
        self.socket_opts.apply(&client).ok();

        // Client leg: connected as accepted, unless we terminate TLS
        let mut client: BoxedStream = match &self.acceptor {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(client)
                    .await
                    .with_context(|| format!("Client TLS handshake failed for {}", self.peer))?;
                debug!("TLS negotiated with client {}", self.peer);
                Box::new(stream)
            }
            None => Box::new(client),
        };

        // Upstream leg: connect, then handshake when the target takes TLS
        let upstream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.target.addr))
            .await
            .map_err(|_| anyhow::anyhow!("Connection timeout to {}", self.target))?
            .with_context(|| format!("Failed to connect to {}", self.target))?;
        self.socket_opts.apply(&upstream).ok();

        let mut upstream: BoxedStream = match &self.connector {
            Some(connector) => {
                let name = tls::server_name(&self.target)?;
                let stream = connector
                    .connect(name, upstream)
                    .await
                    .with_context(|| format!("TLS handshake failed with {}", self.target))?;
                debug!("TLS negotiated with target {}", self.target);
                Box::new(stream)
            }
            None => Box::new(upstream),
        };

        debug!("Relay established {} -> {}", self.peer, self.target);

        let (to_target, to_client) = copy_legs(&mut client, &mut upstream, self.chunk_size).await?;

        debug!(
            "Relay closing {} -> {} ({} bytes up, {} bytes down)",
            self.peer, self.target, to_target, to_client
        );
        Ok(())
    }
}
