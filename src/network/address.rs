use crate::errdata;
use crate::error::{Error, Result};

use std::net::{SocketAddr, ToSocketAddrs as _};

/// A peer identity: a hostname and port with the canonical string form
/// "hostname:port". The literal "localhost" is replaced by the local
/// machine's hostname at construction, so that the advertised name a node
/// hands to its peers is reachable from other machines. Equality, hashing,
/// and ordering all follow the canonical form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    host: String,
    port: u16,
}

impl NodeId {
    /// Creates a node identity, canonicalizing "localhost" to the machine
    /// hostname. An empty host is kept as-is (it only occurs in sentinel
    /// addresses like ":0").
    pub fn new(host: &str, port: u16) -> Self {
        let host = if host.eq_ignore_ascii_case("localhost") {
            whoami::fallible::hostname().unwrap_or_else(|_| host.to_owned())
        } else {
            host.to_owned()
        };
        Self { host, port }
    }

    /// The hostname part.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The canonical "hostname:port" form.
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolves the identity to socket addresses for dialing.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> =
            (self.host.as_str(), self.port).to_socket_addrs().map_err(Error::from)?.collect();
        if addrs.is_empty() {
            return Err(Error::Network(format!("address {self} did not resolve")));
        }
        Ok(addrs)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name().cmp(&other.name())
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::str::FromStr for NodeId {
    type Err = Error;

    /// Parses a "hostname:port" string, canonicalizing "localhost". The host
    /// may be empty, which is only meaningful for sentinel addresses.
    fn from_str(s: &str) -> Result<Self> {
        let Some((host, port)) = s.rsplit_once(':') else {
            return errdata!("invalid node address {s}, expected host:port");
        };
        let port =
            port.parse::<u16>().map_err(|_| Error::InvalidData(format!("invalid port {port}")))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let id: NodeId = "example.com:5000".parse().unwrap();
        assert_eq!(id.host(), "example.com");
        assert_eq!(id.port(), 5000);
        assert_eq!(id.name(), "example.com:5000");
    }

    #[test]
    fn parse_sentinel() {
        let id: NodeId = ":0".parse().unwrap();
        assert_eq!(id.host(), "");
        assert_eq!(id.port(), 0);
    }

    #[test]
    fn parse_invalid() {
        assert!("example.com".parse::<NodeId>().is_err());
        assert!("example.com:notaport".parse::<NodeId>().is_err());
        assert!("example.com:99999".parse::<NodeId>().is_err());
    }

    #[test]
    fn localhost_resolves() {
        let id = NodeId::new("localhost", 5000);
        // The canonical form never contains the literal "localhost" on hosts
        // whose hostname is resolvable.
        if let Ok(hostname) = whoami::fallible::hostname() {
            assert_eq!(id.host(), hostname);
        }
    }

    #[test]
    fn ordering_is_lexicographic_on_name() {
        let a = NodeId::new("node", 2);
        let b = NodeId::new("node", 10);
        // "node:10" sorts before "node:2" lexicographically.
        assert!(b < a);
    }

    #[test]
    fn equality() {
        assert_eq!(NodeId::new("a", 1), "a:1".parse().unwrap());
        assert_ne!(NodeId::new("a", 1), NodeId::new("a", 2));
    }
}
