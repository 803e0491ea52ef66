//! Shared relay plumbing
//!
//! Boxed stream type unifying plain and TLS legs, socket option handling,
//! and the chunked bidirectional copy that moves bytes between the legs of
//! an established session.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A relayable stream: one leg of a session, plain or TLS
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Boxed leg used once the handshakes are done and the transport no longer
/// matters
pub type BoxedStream = Box<dyn RelayStream>;

/// Socket options applied to both TCP legs before relaying
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// Deliver urgent bytes inline (SO_OOBINLINE)
    pub oob_inline: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            oob_inline: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Apply the options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        let socket = socket2::SockRef::from(stream);

        // Without SO_OOBINLINE the kernel holds urgent bytes out of the
        // normal stream and plain reads never see them
        socket.set_out_of_band_inline(self.oob_inline)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(std::time::Duration::from_secs(timeout))
                .with_interval(std::time::Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Copy data between two legs until both directions reach EOF or either
/// errors.
///
/// Each direction reads at most `chunk_size` bytes per wakeup and forwards
/// them to the opposite leg; EOF on one direction shuts down the write half
/// of the other, so half-closes propagate instead of killing the session.
pub async fn copy_legs(
    a: &mut BoxedStream,
    b: &mut BoxedStream,
    chunk_size: usize,
) -> io::Result<(u64, u64)> {
    tokio::io::copy_bidirectional_with_sizes(a, b, chunk_size, chunk_size).await
}
