//! Configuration for the relay binaries
//!
//! Command-line arguments shared by both relays live in [`CommonArgs`] and
//! are flattened into each binary's parser. Validation collects every
//! problem before reporting, so the operator sees the whole list at once,
//! and produces an immutable config struct consumed by the servers.

use crate::error::RelayError;
use crate::filter::AddressFilter;
use crate::target::{detect_loop, Strategy, Target};
use clap::Args;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default chunk size for TCP relay copies
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Idle timeout after which a quiet UDP session is reaped
pub const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Arguments shared by `relay-tcp` and `relay-udp`
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Upstream targets
    #[arg(required = true, value_name = "TARGET[:PORT]")]
    pub targets: Vec<String>,

    /// Bind address
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0")]
    pub bind_addr: Option<IpAddr>,

    /// Bind port
    #[arg(short = 'p', long = "port", default_value_t = 4444)]
    pub port: u16,

    /// Default port for targets that omit one (defaults to the bind port)
    #[arg(long = "target-port", value_name = "PORT")]
    pub target_port: Option<u16>,

    /// Pick a random target per connection
    #[arg(long = "random-target", conflicts_with = "round_robin_target")]
    pub random_target: bool,

    /// Rotate through targets in configuration order (default)
    #[arg(long = "round-robin-target")]
    pub round_robin_target: bool,

    /// Allow an address or CIDR range (repeatable)
    #[arg(short = 'a', long = "allow", value_name = "SPEC")]
    pub allow: Vec<String>,

    /// Load allow entries from a newline-delimited file (repeatable)
    #[arg(short = 'A', long = "allow-file", value_name = "FILE")]
    pub allow_file: Vec<PathBuf>,

    /// Deny an address or CIDR range (repeatable)
    #[arg(short = 'd', long = "deny", value_name = "SPEC")]
    pub deny: Vec<String>,

    /// Load deny entries from a newline-delimited file (repeatable)
    #[arg(short = 'D', long = "deny-file", value_name = "FILE")]
    pub deny_file: Vec<PathBuf>,

    /// Verbose connection lifecycle logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// TCP-only arguments
#[derive(Args, Debug, Clone, Default)]
pub struct TcpArgs {
    /// PEM certificate file; enables TLS termination on the listening side
    #[arg(short = 'c', long = "cert", value_name = "CERTFILE", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key file for the listening certificate
    #[arg(short = 'k', long = "key", value_name = "KEYFILE", requires = "cert")]
    pub key: Option<PathBuf>,

    /// Wrap upstream connections in TLS with certificate verification
    #[arg(long = "target-ssl")]
    pub target_ssl: bool,

    /// Wrap upstream connections in TLS without certificate verification
    #[arg(long = "target-ssl-insecure")]
    pub target_ssl_insecure: bool,

    /// Relay copy chunk size in bytes
    #[arg(long = "chunk-size", default_value_t = DEFAULT_CHUNK_SIZE, value_name = "BYTES")]
    pub chunk_size: usize,
}

/// UDP-only arguments
#[derive(Args, Debug, Clone, Default)]
pub struct UdpArgs {
    /// Broadcast each datagram to all targets until a reply source is pinned
    #[arg(short = 'm', long = "broadcast")]
    pub broadcast: bool,

    /// Fire-and-forget: do not listen for target replies
    #[arg(short = 'n', long = "no-reply")]
    pub no_reply: bool,
}

/// Upstream TLS mode for the TCP relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetTls {
    /// Plain TCP upstream
    #[default]
    Off,
    /// TLS with hostname and certificate verification
    Verify,
    /// TLS accepting any certificate
    Insecure,
}

/// Server-side TLS material paths
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    /// PEM certificate chain
    pub cert: PathBuf,
    /// PEM private key
    pub key: PathBuf,
}

/// Configuration shared by both relay variants, immutable after validation
#[derive(Debug)]
pub struct CommonConfig {
    /// Listening address
    pub bind: SocketAddr,
    /// Resolved upstream targets, in configuration order
    pub targets: Vec<Target>,
    /// Balancing strategy
    pub strategy: Strategy,
    /// Peer admission filter
    pub filter: AddressFilter,
    /// Verbose lifecycle logging requested
    pub verbose: bool,
}

impl CommonConfig {
    /// Validate shared arguments, collecting every error before failing
    pub fn from_args(args: &CommonArgs) -> Result<Self, RelayError> {
        let mut errors = Vec::new();

        let bind_ip = args
            .bind_addr
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let bind = SocketAddr::new(bind_ip, args.port);
        let default_port = args.target_port.unwrap_or(args.port);

        let mut targets = Vec::new();
        for spec in &args.targets {
            match Target::parse(spec, default_port) {
                Ok(target) => targets.push(target),
                Err(e) => errors.push(format!("{:#}", e)),
            }
        }

        if targets.is_empty() && errors.is_empty() {
            errors.push("At least one target is required".to_string());
        }

        if let Err(e) = detect_loop(bind, &targets) {
            errors.push(format!("{:#}", e));
        }

        let mut filter = AddressFilter::new();
        for spec in &args.allow {
            if let Err(e) = filter.add_allow(spec) {
                errors.push(format!("{:#}", e));
            }
        }
        for path in &args.allow_file {
            if let Err(e) = filter.add_allow_file(path) {
                errors.push(format!("{:#}", e));
            }
        }
        for spec in &args.deny {
            if let Err(e) = filter.add_deny(spec) {
                errors.push(format!("{:#}", e));
            }
        }
        for path in &args.deny_file {
            if let Err(e) = filter.add_deny_file(path) {
                errors.push(format!("{:#}", e));
            }
        }

        let strategy = if args.random_target {
            Strategy::Random
        } else {
            Strategy::RoundRobin
        };

        if !errors.is_empty() {
            return Err(RelayError::Config(errors));
        }

        Ok(CommonConfig {
            bind,
            targets,
            strategy,
            filter,
            verbose: args.verbose,
        })
    }
}

/// Full configuration for the TCP relay
#[derive(Debug)]
pub struct TcpRelayConfig {
    /// Shared relay configuration
    pub common: CommonConfig,
    /// Listening-side TLS material, when terminating TLS
    pub tls: Option<TlsIdentity>,
    /// Upstream TLS mode
    pub target_tls: TargetTls,
    /// Relay copy chunk size
    pub chunk_size: usize,
}

impl TcpRelayConfig {
    /// Validate TCP relay arguments
    pub fn from_args(common: &CommonArgs, tcp: &TcpArgs) -> Result<Self, RelayError> {
        let mut errors = Vec::new();

        let common_cfg = match CommonConfig::from_args(common) {
            Ok(cfg) => Some(cfg),
            Err(RelayError::Config(errs)) => {
                errors.extend(errs);
                None
            }
        };

        let tls = match (&tcp.cert, &tcp.key) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    errors.push(format!("Certificate file not found: {}", cert.display()));
                }
                if !key.exists() {
                    errors.push(format!("Key file not found: {}", key.display()));
                }
                Some(TlsIdentity {
                    cert: cert.clone(),
                    key: key.clone(),
                })
            }
            (None, None) => None,
            // clap `requires` already rejects these, keep the check for
            // programmatic construction
            _ => {
                errors.push("Both certificate and key are required for TLS".to_string());
                None
            }
        };

        if tcp.chunk_size == 0 {
            errors.push("Chunk size must be greater than zero".to_string());
        }

        let target_tls = if tcp.target_ssl_insecure {
            TargetTls::Insecure
        } else if tcp.target_ssl {
            TargetTls::Verify
        } else {
            TargetTls::Off
        };

        match (common_cfg, errors.is_empty()) {
            (Some(common), true) => Ok(TcpRelayConfig {
                common,
                tls,
                target_tls,
                chunk_size: tcp.chunk_size,
            }),
            _ => Err(RelayError::Config(errors)),
        }
    }
}

/// Full configuration for the UDP relay
#[derive(Debug)]
pub struct UdpRelayConfig {
    /// Shared relay configuration
    pub common: CommonConfig,
    /// Broadcast each datagram to all targets until pinned
    pub broadcast: bool,
    /// Do not listen for target replies
    pub no_reply: bool,
    /// Idle timeout before a quiet session is reaped
    pub session_timeout: Duration,
}

impl UdpRelayConfig {
    /// Validate UDP relay arguments
    pub fn from_args(common: &CommonArgs, udp: &UdpArgs) -> Result<Self, RelayError> {
        let common = CommonConfig::from_args(common)?;
        Ok(UdpRelayConfig {
            common,
            broadcast: udp.broadcast,
            no_reply: udp.no_reply,
            session_timeout: UDP_SESSION_TIMEOUT,
        })
    }

    /// Override the session idle timeout (used by tests)
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestTcpCli {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        tcp: TcpArgs,
    }

    #[derive(Parser, Debug)]
    struct TestUdpCli {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        udp: UdpArgs,
    }

    fn parse_tcp(argv: &[&str]) -> TestTcpCli {
        TestTcpCli::parse_from(std::iter::once("relay-tcp").chain(argv.iter().copied()))
    }

    fn parse_udp(argv: &[&str]) -> TestUdpCli {
        TestUdpCli::parse_from(std::iter::once("relay-udp").chain(argv.iter().copied()))
    }

    #[test]
    fn test_minimal_tcp_config() {
        let cli = parse_tcp(&["127.0.0.1:8080", "-p", "9999"]);
        let config = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap();
        assert_eq!(config.common.bind, "0.0.0.0:9999".parse().unwrap());
        assert_eq!(config.common.targets.len(), 1);
        assert_eq!(config.target_tls, TargetTls::Off);
        assert!(config.tls.is_none());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_target_port_default_applies() {
        let cli = parse_tcp(&["10.1.2.3", "-p", "9999", "--target-port", "8080"]);
        let config = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap();
        assert_eq!(config.common.targets[0].addr.port(), 8080);
    }

    #[test]
    fn test_target_port_falls_back_to_bind_port() {
        let cli = parse_tcp(&["10.1.2.3", "-p", "9999"]);
        let config = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap();
        assert_eq!(config.common.targets[0].addr.port(), 9999);
    }

    #[test]
    fn test_strategy_selection() {
        let cli = parse_udp(&["10.1.2.3:53", "10.1.2.4:53", "--random-target"]);
        let config = UdpRelayConfig::from_args(&cli.common, &cli.udp).unwrap();
        assert_eq!(config.common.strategy, Strategy::Random);

        let cli = parse_udp(&["10.1.2.3:53", "--round-robin-target"]);
        let config = UdpRelayConfig::from_args(&cli.common, &cli.udp).unwrap();
        assert_eq!(config.common.strategy, Strategy::RoundRobin);
    }

    #[test]
    fn test_loop_detection_rejected() {
        let cli = parse_tcp(&["127.0.0.1:4444", "-b", "127.0.0.1", "-p", "4444"]);
        let err = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_wildcard_loop_detection_rejected() {
        let cli = parse_tcp(&["192.0.2.1:4444", "-p", "4444"]);
        let err = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
    }

    #[test]
    fn test_errors_are_collected() {
        let cli = parse_tcp(&[
            "no-such-host-777.invalid:80",
            "-d",
            "not-a-spec/99",
            "-p",
            "9999",
        ]);
        let err = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap_err();
        match err {
            RelayError::Config(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_tls_material_rejected() {
        let cli = parse_tcp(&[
            "10.1.2.3:80",
            "-p",
            "9999",
            "-c",
            "/nonexistent/cert.pem",
            "-k",
            "/nonexistent/key.pem",
        ]);
        let err = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap_err();
        match err {
            RelayError::Config(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_target_ssl_modes() {
        let cli = parse_tcp(&["10.1.2.3:80", "-p", "9999", "--target-ssl"]);
        let config = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap();
        assert_eq!(config.target_tls, TargetTls::Verify);

        let cli = parse_tcp(&["10.1.2.3:80", "-p", "9999", "--target-ssl-insecure"]);
        let config = TcpRelayConfig::from_args(&cli.common, &cli.tcp).unwrap();
        assert_eq!(config.target_tls, TargetTls::Insecure);
    }

    #[test]
    fn test_udp_flags() {
        let cli = parse_udp(&["10.1.2.3:53", "-p", "9999", "-m", "-n"]);
        let config = UdpRelayConfig::from_args(&cli.common, &cli.udp).unwrap();
        assert!(config.broadcast);
        assert!(config.no_reply);
        assert_eq!(config.session_timeout, UDP_SESSION_TIMEOUT);
    }

    #[test]
    fn test_session_timeout_override() {
        let cli = parse_udp(&["10.1.2.3:53", "-p", "9999"]);
        let config = UdpRelayConfig::from_args(&cli.common, &cli.udp)
            .unwrap()
            .with_session_timeout(Duration::from_millis(100));
        assert_eq!(config.session_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_filter_entries_applied() {
        let cli = parse_udp(&[
            "10.1.2.3:53",
            "-p",
            "9999",
            "-a",
            "10.0.0.0/8",
            "-d",
            "10.0.0.5",
        ]);
        let config = UdpRelayConfig::from_args(&cli.common, &cli.udp).unwrap();
        assert!(config.common.filter.admit("10.0.0.1".parse().unwrap()));
        assert!(!config.common.filter.admit("10.0.0.5".parse().unwrap()));
        assert!(!config.common.filter.admit("11.0.0.1".parse().unwrap()));
    }
}
