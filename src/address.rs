//! Structural URL-like connection targets.

use crate::error::BlipError;
use std::fmt;
use std::str::FromStr;

const SCHEMES: &[&str] = &["ws", "wss", "http", "https", "blip", "blips"];

/// A connection target: `scheme:hostname[:port]/path`.
///
/// The port is never zero after construction; it defaults from the scheme
/// (443 for the secure schemes, 80 otherwise). The scheme is stored
/// lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub scheme: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

impl Address {
    /// Build an address; `port == 0` selects the scheme's default port.
    pub fn new(
        scheme: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Address {
        let mut address = Address {
            scheme: scheme.into().to_ascii_lowercase(),
            hostname: hostname.into(),
            port,
            path: path.into(),
        };
        if address.port == 0 {
            address.port = address.default_port();
        }
        address
    }

    /// Whether the scheme implies TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "wss" | "https" | "blips")
    }

    /// The port implied by the scheme.
    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            443
        } else {
            80
        }
    }

    /// Case-insensitive domain equality.
    pub fn domain_equals(d1: &str, d2: &str) -> bool {
        d1.eq_ignore_ascii_case(d2)
    }

    /// Whether `hostname` is `base_domain` itself or a subdomain of it.
    pub fn domain_contains(base_domain: &str, hostname: &str) -> bool {
        let host = hostname.as_bytes();
        let base = base_domain.as_bytes();
        if host.len() < base.len() {
            return false;
        }
        host[host.len() - base.len()..].eq_ignore_ascii_case(base)
            && (host.len() == base.len() || host[host.len() - base.len() - 1] == b'.')
    }

    /// Whether `path` lies within `base_path`. An empty base matches every
    /// path; otherwise the base must be a prefix ending on a path-segment
    /// boundary.
    pub fn path_contains(base_path: &str, path: &str) -> bool {
        if base_path.is_empty() {
            return true;
        }
        if path.is_empty() {
            return false;
        }
        path.starts_with(base_path)
            && (path.len() == base_path.len()
                || path.as_bytes()[base_path.len()] == b'/'
                || base_path.ends_with('/'))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.hostname)?;
        if self.port != self.default_port() {
            write!(f, ":{}", self.port)?;
        }
        if self.path.is_empty() || !self.path.starts_with('/') {
            write!(f, "/")?;
        }
        write!(f, "{}", self.path)
    }
}

impl FromStr for Address {
    type Err = BlipError;

    fn from_str(s: &str) -> Result<Address, BlipError> {
        let invalid = || BlipError::InvalidAddress(s.to_string());
        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;
        let scheme = scheme.to_ascii_lowercase();
        if !SCHEMES.contains(&scheme.as_str()) {
            return Err(invalid());
        }
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, ""),
        };
        let (hostname, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, 0),
        };
        if hostname.is_empty() {
            return Err(invalid());
        }
        Ok(Address::new(scheme, hostname, port, path))
    }
}
