//! Address-based access control
//!
//! Allow/deny lists of IPv4 addresses and CIDR ranges, populated once at
//! startup and consulted for every connecting or sending peer.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::Path;

/// A single allow or deny entry.
///
/// Keeps the original input string so startup summaries and error messages
/// can show what the operator actually typed.
#[derive(Debug, Clone)]
enum FilterEntry {
    /// Exact address
    Addr(Ipv4Addr, String),
    /// CIDR network
    Net(Ipv4Net, String),
}

impl FilterEntry {
    fn matches(&self, ip: Ipv4Addr) -> bool {
        match self {
            FilterEntry::Addr(addr, _) => *addr == ip,
            FilterEntry::Net(net, _) => net.contains(&ip),
        }
    }

    fn display(&self) -> &str {
        match self {
            FilterEntry::Addr(_, s) | FilterEntry::Net(_, s) => s,
        }
    }
}

/// Address filter with allow and deny lists.
///
/// Admission rules:
/// - with at least one allow entry present, a peer must match an allow entry
///   or it is rejected,
/// - deny entries are checked afterwards and win over a matching allow.
///
/// Both lists are append-only during configuration and read-only afterwards.
#[derive(Debug, Default)]
pub struct AddressFilter {
    allow: Vec<FilterEntry>,
    deny: Vec<FilterEntry>,
}

impl AddressFilter {
    /// Create an empty filter that admits everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an allow entry from a spec string (address, hostname or CIDR)
    pub fn add_allow(&mut self, spec: &str) -> Result<()> {
        let entry = parse_spec(spec)?;
        self.allow.push(entry);
        Ok(())
    }

    /// Add a deny entry from a spec string (address, hostname or CIDR)
    pub fn add_deny(&mut self, spec: &str) -> Result<()> {
        let entry = parse_spec(spec)?;
        self.deny.push(entry);
        Ok(())
    }

    /// Load allow entries from a newline-delimited file
    pub fn add_allow_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        for spec in read_spec_file(path.as_ref())? {
            self.add_allow(&spec)?;
        }
        Ok(())
    }

    /// Load deny entries from a newline-delimited file
    pub fn add_deny_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        for spec in read_spec_file(path.as_ref())? {
            self.add_deny(&spec)?;
        }
        Ok(())
    }

    /// Decide admission for a peer address.
    ///
    /// IPv4-mapped IPv6 addresses are canonicalized first. A genuine IPv6
    /// peer matches no entry: it is rejected when an allow list exists and
    /// admitted otherwise.
    pub fn admit(&self, ip: IpAddr) -> bool {
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return self.allow.is_empty(),
            },
        };

        if !self.allow.is_empty() && !self.allow.iter().any(|e| e.matches(v4)) {
            return false;
        }
        !self.deny.iter().any(|e| e.matches(v4))
    }

    /// Number of allow entries
    pub fn allow_count(&self) -> usize {
        self.allow.len()
    }

    /// Number of deny entries
    pub fn deny_count(&self) -> usize {
        self.deny.len()
    }

    /// Entries formatted for the startup summary
    pub fn describe(&self) -> String {
        let allow: Vec<&str> = self.allow.iter().map(|e| e.display()).collect();
        let deny: Vec<&str> = self.deny.iter().map(|e| e.display()).collect();
        format!("allow=[{}] deny=[{}]", allow.join(", "), deny.join(", "))
    }
}

/// Parse a filter spec: CIDR when it contains a slash, otherwise a numeric
/// address with DNS fallback. Resolution happens once, at configuration time.
fn parse_spec(spec: &str) -> Result<FilterEntry> {
    let spec = spec.trim();
    if spec.is_empty() {
        anyhow::bail!("Empty filter spec");
    }

    if spec.contains('/') {
        let net: Ipv4Net = spec
            .parse()
            .with_context(|| format!("Invalid CIDR range: {}", spec))?;
        return Ok(FilterEntry::Net(net, spec.to_string()));
    }

    if let Ok(addr) = spec.parse::<Ipv4Addr>() {
        return Ok(FilterEntry::Addr(addr, spec.to_string()));
    }

    // Not numeric, try DNS
    let resolved = (spec, 0)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve filter address: {}", spec))?
        .find_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .with_context(|| format!("No IPv4 address found for: {}", spec))?;

    Ok(FilterEntry::Addr(resolved, spec.to_string()))
}

/// Read a newline-delimited spec file, skipping blanks and `#` comments
fn read_spec_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read filter file: {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}
