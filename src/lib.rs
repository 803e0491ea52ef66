//! # Netrelay - Asynchronous TCP/UDP Relay Pair
//!
//! Netrelay is a pair of single-purpose relay servers, `relay-tcp` and
//! `relay-udp`, sharing one library. Each binds a listening socket, admits
//! or rejects peers through an address filter, selects an upstream target
//! via a balancing strategy, and relays traffic transparently — the
//! application-layer bytes are never interpreted or altered.
//!
//! ## Features
//!
//! - **Address filtering**: allow/deny lists of addresses and CIDR ranges,
//!   deny always winning on conflict
//! - **Target balancing**: round-robin (deterministic) or random selection
//!   over any number of upstream targets, with relay-loop detection
//! - **TLS on either TCP leg**: termination on the listening side,
//!   origination (verified or not) on the upstream side
//! - **UDP sessions**: per-client outbound sockets, broadcast-to-all mode
//!   with reply-source pinning, send backlogs and idle-session expiry
//!
//! ## Usage
//!
//! ```rust,ignore
//! use netrelay::config::{CommonArgs, TcpArgs, TcpRelayConfig};
//! use netrelay::tcp::TcpRelayServer;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TcpRelayConfig::from_args(&common_args, &tcp_args)?;
//!     let server = TcpRelayServer::bind(config).await?;
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!     server.run(shutdown_rx).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod filter;
pub mod relay;
pub mod target;
pub mod tcp;
pub mod tls;
pub mod udp;

// Re-export commonly used items
pub use error::RelayError;
pub use filter::AddressFilter;
pub use target::{Strategy, Target, TargetSelector};

/// Version of the Netrelay library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
