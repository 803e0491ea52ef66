//! Test utilities for Netrelay integration tests
//!
//! Local echo/tag servers and config builders shared across the suites.

use netrelay::config::{
    CommonConfig, TargetTls, TcpRelayConfig, UdpRelayConfig, DEFAULT_CHUNK_SIZE,
    UDP_SESSION_TIMEOUT,
};
use netrelay::filter::AddressFilter;
use netrelay::target::{Strategy, Target};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// Spawn a TCP echo server, returning its address
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Spawn a TCP server that writes a single tag byte to every connection and
/// closes, so tests can tell which target a relayed connection reached
pub async fn spawn_tcp_tag(tag: u8) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(&[tag]).await;
        }
    });
    addr
}

/// Spawn a UDP echo server, returning its address
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });
    addr
}

/// Target struct for a resolved address
pub fn target(addr: SocketAddr) -> Target {
    Target {
        addr,
        host: addr.ip().to_string(),
    }
}

/// Common config bound to an ephemeral localhost port
pub fn common_config(targets: Vec<SocketAddr>, filter: AddressFilter) -> CommonConfig {
    CommonConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        targets: targets.into_iter().map(target).collect(),
        strategy: Strategy::RoundRobin,
        filter,
        verbose: false,
    }
}

/// TCP relay config with defaults suitable for tests
pub fn tcp_config(targets: Vec<SocketAddr>, filter: AddressFilter) -> TcpRelayConfig {
    TcpRelayConfig {
        common: common_config(targets, filter),
        tls: None,
        target_tls: TargetTls::Off,
        chunk_size: DEFAULT_CHUNK_SIZE,
    }
}

/// UDP relay config with defaults suitable for tests
pub fn udp_config(targets: Vec<SocketAddr>, filter: AddressFilter) -> UdpRelayConfig {
    UdpRelayConfig {
        common: common_config(targets, filter),
        broadcast: false,
        no_reply: false,
        session_timeout: UDP_SESSION_TIMEOUT,
    }
}
