//! Upstream targets and balancing strategies
//!
//! Targets are resolved once at startup and shared read-only between
//! sessions. The selector hands them out round-robin, randomly, or via a
//! single-target fast path.

use anyhow::{Context, Result};
use rand::Rng;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// An upstream endpoint.
///
/// Immutable once resolved. The original hostname string is kept for TLS
/// SNI and display.
#[derive(Debug, Clone)]
pub struct Target {
    /// Resolved socket address
    pub addr: SocketAddr,
    /// Hostname as originally configured
    pub host: String,
}

impl Target {
    /// Parse and resolve a `host[:port]` spec, applying `default_port` when
    /// the port is omitted.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            anyhow::bail!("Empty target spec");
        }

        let (host, port) = match spec.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("Invalid target port in: {}", spec))?;
                (host, port)
            }
            _ => (spec, default_port),
        };

        let addr = resolve_host(host, port)
            .with_context(|| format!("Failed to resolve target: {}", spec))?;

        Ok(Target {
            addr,
            host: host.to_string(),
        })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host == self.addr.ip().to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.host, self.addr)
        }
    }
}

/// Resolve a hostname, preferring IPv4 results
fn resolve_host(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve: {}", host))?
        .collect();

    addrs
        .iter()
        .find(|sa| sa.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("No addresses found for: {}", host))
}

/// Balancing strategy for target selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Deterministic cyclic rotation in configuration order
    #[default]
    RoundRobin,
    /// Uniform random pick per call
    Random,
}

/// Hands out targets according to the configured strategy.
///
/// A selector with exactly one target always returns it and skips all
/// rotation bookkeeping.
#[derive(Debug)]
pub struct TargetSelector {
    targets: Vec<Arc<Target>>,
    strategy: Strategy,
    next: AtomicUsize,
}

impl TargetSelector {
    /// Create a selector; at least one target is required
    pub fn new(targets: Vec<Target>, strategy: Strategy) -> Result<Self> {
        if targets.is_empty() {
            anyhow::bail!("At least one target is required");
        }
        Ok(TargetSelector {
            targets: targets.into_iter().map(Arc::new).collect(),
            strategy,
            next: AtomicUsize::new(0),
        })
    }

    /// Select the next target according to the strategy
    pub fn pick(&self) -> Arc<Target> {
        if self.targets.len() == 1 {
            return self.targets[0].clone();
        }
        match self.strategy {
            Strategy::RoundRobin => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.targets.len();
                self.targets[idx].clone()
            }
            Strategy::Random => {
                let idx = rand::thread_rng().gen_range(0..self.targets.len());
                self.targets[idx].clone()
            }
        }
    }

    /// All configured targets, in configuration order
    pub fn all(&self) -> &[Arc<Target>] {
        &self.targets
    }

    /// Number of configured targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no targets are configured (never, post construction)
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Reject any target that would make the relay forward to itself.
///
/// A target loops when its port equals the bind port and its address either
/// equals the bind address or the bind address is the wildcard.
pub fn detect_loop(bind: SocketAddr, targets: &[Target]) -> Result<()> {
    for target in targets {
        if target.addr.port() != bind.port() {
            continue;
        }
        let bind_ip = bind.ip();
        if bind_ip.is_unspecified() || target.addr.ip() == bind_ip {
            anyhow::bail!(
                "Target {} loops back to the relay's own bind address {}",
                target,
                bind
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::IpAddr;

    fn target(addr: &str) -> Target {
        let addr: SocketAddr = addr.parse().unwrap();
        Target {
            addr,
            host: addr.ip().to_string(),
        }
    }

    #[test]
    fn test_parse_with_port() {
        let t = Target::parse("127.0.0.1:8080", 4444).unwrap();
        assert_eq!(t.addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(t.host, "127.0.0.1");
    }

    #[test]
    fn test_parse_without_port_uses_default() {
        let t = Target::parse("127.0.0.1", 4444).unwrap();
        assert_eq!(t.addr.port(), 4444);
    }

    #[test]
    fn test_parse_hostname_keeps_original() {
        let t = Target::parse("localhost:80", 4444).unwrap();
        assert_eq!(t.host, "localhost");
        assert_eq!(t.addr.port(), 80);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Target::parse("", 4444).is_err());
        assert!(Target::parse("127.0.0.1:notaport", 4444).is_err());
        assert!(Target::parse("no-such-host-2718.invalid:80", 4444).is_err());
    }

    #[test]
    fn test_selector_requires_targets() {
        assert!(TargetSelector::new(vec![], Strategy::RoundRobin).is_err());
    }

    #[test]
    fn test_single_target_fast_path() {
        let sel = TargetSelector::new(vec![target("10.0.0.1:80")], Strategy::Random).unwrap();
        for _ in 0..10 {
            assert_eq!(sel.pick().addr, "10.0.0.1:80".parse::<SocketAddr>().unwrap());
        }
        // Rotation index untouched
        assert_eq!(sel.next.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let sel = TargetSelector::new(
            vec![
                target("10.0.0.1:80"),
                target("10.0.0.2:80"),
                target("10.0.0.3:80"),
            ],
            Strategy::RoundRobin,
        )
        .unwrap();

        let picks: Vec<u16> = (0..6)
            .map(|_| match sel.pick().addr.ip() {
                IpAddr::V4(v4) => v4.octets()[3] as u16,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_round_robin_even_distribution() {
        let sel = TargetSelector::new(
            vec![target("10.0.0.1:80"), target("10.0.0.2:80")],
            Strategy::RoundRobin,
        )
        .unwrap();

        let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
        for _ in 0..7 {
            *counts.entry(sel.pick().addr).or_default() += 1;
        }
        // 7 picks over 2 targets: 4 and 3
        let mut seen: Vec<usize> = counts.values().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![3, 4]);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let sel = TargetSelector::new(
            vec![target("10.0.0.1:80"), target("10.0.0.2:80")],
            Strategy::Random,
        )
        .unwrap();
        for _ in 0..50 {
            let picked = sel.pick();
            assert!(sel.all().iter().any(|t| t.addr == picked.addr));
        }
    }

    #[test]
    fn test_loop_detection_exact_match() {
        let bind: SocketAddr = "192.168.1.10:4444".parse().unwrap();
        let targets = vec![target("192.168.1.10:4444")];
        assert!(detect_loop(bind, &targets).is_err());
    }

    #[test]
    fn test_loop_detection_wildcard_bind() {
        let bind: SocketAddr = "0.0.0.0:4444".parse().unwrap();
        let targets = vec![target("10.0.0.1:4444")];
        assert!(detect_loop(bind, &targets).is_err());
    }

    #[test]
    fn test_loop_detection_different_port_ok() {
        let bind: SocketAddr = "0.0.0.0:4444".parse().unwrap();
        let targets = vec![target("10.0.0.1:8080")];
        assert!(detect_loop(bind, &targets).is_ok());
    }

    #[test]
    fn test_loop_detection_different_ip_ok() {
        let bind: SocketAddr = "192.168.1.10:4444".parse().unwrap();
        let targets = vec![target("10.0.0.1:4444")];
        assert!(detect_loop(bind, &targets).is_ok());
    }

    #[test]
    fn test_target_display() {
        let t = Target {
            addr: "10.0.0.1:80".parse().unwrap(),
            host: "example.com".to_string(),
        };
        assert_eq!(format!("{}", t), "example.com (10.0.0.1:80)");

        let t = target("10.0.0.1:80");
        assert_eq!(format!("{}", t), "10.0.0.1:80");
    }
}
