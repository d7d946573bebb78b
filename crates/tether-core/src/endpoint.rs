//! Network endpoints and peer addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

/// Transport protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Datagram substrate
    Udp,
    /// Stream substrate
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// A concrete network address plus the protocol used to reach it
///
/// Rendered as `udp:1.2.3.4:5000` or `tcp:[::1]:5000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Socket address (family is implied by the address)
    pub addr: SocketAddr,
    /// Transport protocol
    pub protocol: Protocol,
}

impl Endpoint {
    /// UDP endpoint
    #[must_use]
    pub const fn udp(addr: SocketAddr) -> Self {
        Self {
            addr,
            protocol: Protocol::Udp,
        }
    }

    /// TCP endpoint
    #[must_use]
    pub const fn tcp(addr: SocketAddr) -> Self {
        Self {
            addr,
            protocol: Protocol::Tcp,
        }
    }

    /// Whether this endpoint uses UDP
    #[must_use]
    pub fn is_udp(&self) -> bool {
        self.protocol == Protocol::Udp
    }

    /// Whether the endpoint can possibly be reached
    ///
    /// Rejects port zero, unspecified, multicast and broadcast addresses.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        if self.addr.port() == 0 {
            return false;
        }
        match self.addr.ip() {
            IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
            IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
        }
    }

    /// Guess neighbouring ports: `expand` below and `expand` above
    ///
    /// Symmetric NATs often allocate external ports sequentially, so the
    /// mapping the peer uses towards us is likely close to the one it
    /// advertised. Ports outside `1..=65535` are skipped.
    #[must_use]
    pub fn neighbors(&self, expand: u16) -> Vec<Endpoint> {
        let port = i32::from(self.addr.port());
        let mut guesses = Vec::with_capacity(usize::from(expand) * 2);
        for step in [-1i32, 1] {
            for i in 1..=i32::from(expand) {
                let candidate = port + step * i;
                if let Ok(p) = u16::try_from(candidate) {
                    if p != 0 {
                        let mut addr = self.addr;
                        addr.set_port(p);
                        guesses.push(Endpoint {
                            addr,
                            protocol: self.protocol,
                        });
                    }
                }
            }
        }
        guesses
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.addr)
    }
}

/// Endpoint parse failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid endpoint: {0}")]
pub struct ParseEndpointError(String);

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, addr) = s
            .split_once(':')
            .ok_or_else(|| ParseEndpointError(s.to_string()))?;
        let protocol = match proto {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            _ => return Err(ParseEndpointError(s.to_string())),
        };
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| ParseEndpointError(s.to_string()))?;
        Ok(Self { addr, protocol })
    }
}

/// Opaque, address-independent peer identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Create a peer id
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// String form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Virtual port multiplexing connections within one peer
pub type VPort = u16;

/// Per-attempt disambiguator for connections on the same peer and vport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer plus one of its virtual ports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAddr {
    /// Peer
    pub peer: PeerId,
    /// Virtual port
    pub vport: VPort,
}

impl PortAddr {
    /// Create an address
    #[must_use]
    pub fn new(peer: impl Into<PeerId>, vport: VPort) -> Self {
        Self {
            peer: peer.into(),
            vport,
        }
    }
}

impl fmt::Display for PortAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.peer, self.vport)
    }
}

/// A peer and the endpoints it is believed reachable at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer id
    pub peer_id: PeerId,
    /// Candidate endpoints
    pub endpoints: Vec<Endpoint>,
}

impl PeerInfo {
    /// Create peer info
    #[must_use]
    pub fn new(peer_id: impl Into<PeerId>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            peer_id: peer_id.into(),
            endpoints,
        }
    }

    /// Drop endpoints that cannot be reached
    pub fn retain_routable(&mut self) {
        self.endpoints.retain(Endpoint::is_routable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display_roundtrip() {
        let ep: Endpoint = "udp:192.168.1.10:4000".parse().unwrap();
        assert_eq!(ep.protocol, Protocol::Udp);
        assert_eq!(ep.to_string(), "udp:192.168.1.10:4000");

        let v6: Endpoint = "tcp:[::1]:80".parse().unwrap();
        assert_eq!(v6.protocol, Protocol::Tcp);
        assert_eq!(v6.addr.port(), 80);
    }

    #[test]
    fn test_endpoint_parse_rejects_garbage() {
        assert!("sctp:1.2.3.4:5".parse::<Endpoint>().is_err());
        assert!("udp:1.2.3.4".parse::<Endpoint>().is_err());
        assert!("1.2.3.4:5".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_routable() {
        assert!(Endpoint::udp("127.0.0.1:5000".parse().unwrap()).is_routable());
        assert!(!Endpoint::udp("0.0.0.0:5000".parse().unwrap()).is_routable());
        assert!(!Endpoint::udp("10.0.0.1:0".parse().unwrap()).is_routable());
        assert!(!Endpoint::udp("224.0.0.1:5000".parse().unwrap()).is_routable());
        assert!(!Endpoint::udp("255.255.255.255:5000".parse().unwrap()).is_routable());
    }

    #[test]
    fn test_neighbors_window() {
        let ep = Endpoint::udp("203.0.113.5:5000".parse().unwrap());
        let ports: Vec<u16> = ep.neighbors(2).iter().map(|e| e.addr.port()).collect();
        assert_eq!(ports, vec![4999, 4998, 5001, 5002]);
    }

    #[test]
    fn test_neighbors_clamped_at_port_range() {
        let low = Endpoint::udp("203.0.113.5:2".parse().unwrap());
        let ports: Vec<u16> = low.neighbors(3).iter().map(|e| e.addr.port()).collect();
        assert_eq!(ports, vec![1, 3, 4, 5]);

        let high = Endpoint::udp("203.0.113.5:65534".parse().unwrap());
        let ports: Vec<u16> = high.neighbors(2).iter().map(|e| e.addr.port()).collect();
        assert_eq!(ports, vec![65533, 65532, 65535]);
    }
}
