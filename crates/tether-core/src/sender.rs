//! Outbound path to a remote: candidate endpoints plus the socket in use.

use crate::endpoint::Endpoint;
use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier of a punched socket opened by the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which local socket a packet travels through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketRef {
    /// The stack's listening socket
    Primary,
    /// A supplementary punched socket
    Punched(SocketId),
}

impl SocketRef {
    /// Punched socket id, if any
    #[must_use]
    pub const fn punched(self) -> Option<SocketId> {
        match self {
            Self::Primary => None,
            Self::Punched(id) => Some(id),
        }
    }
}

/// Where an inbound packet came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    /// Local socket it arrived on
    pub socket: SocketRef,
    /// Remote endpoint it came from
    pub endpoint: Endpoint,
}

/// A packet the environment must put on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    /// Socket to send through
    pub socket: SocketRef,
    /// Every endpoint the packet goes to
    pub destinations: Vec<Endpoint>,
    /// The packet
    pub packet: Packet,
}

#[derive(Debug, Clone, Default)]
struct Backoff {
    interval: Duration,
    epcount: usize,
    last: Option<Instant>,
}

/// Candidate endpoints of a remote and the socket used to reach them
///
/// Once a packet arrives from the remote the sender latches that endpoint as
/// active and posts there only. Until then, or when asked to re-spray, it
/// posts to every candidate.
#[derive(Debug, Clone)]
pub struct Sender {
    socket: SocketRef,
    stale: bool,
    endpoints: Vec<Endpoint>,
    active: Option<Endpoint>,
    resend_all: bool,
    backoff: Backoff,
    aborted: bool,
}

impl Sender {
    /// Sender with no candidates yet
    #[must_use]
    pub fn new(socket: SocketRef) -> Self {
        Self {
            socket,
            stale: false,
            endpoints: Vec::new(),
            active: None,
            resend_all: false,
            backoff: Backoff::default(),
            aborted: false,
        }
    }

    /// Sender seeded with candidates
    #[must_use]
    pub fn with_endpoints(socket: SocketRef, endpoints: &[Endpoint]) -> Self {
        let mut sender = Self::new(socket);
        sender.add_endpoints(endpoints);
        sender
    }

    /// Sender that answers whoever sent `inbound`
    #[must_use]
    pub fn from_inbound(inbound: &Inbound) -> Self {
        let mut sender = Self::new(inbound.socket);
        sender.endpoints.push(inbound.endpoint);
        sender.active = Some(inbound.endpoint);
        sender
    }

    /// Socket in use
    #[must_use]
    pub fn socket(&self) -> SocketRef {
        self.socket
    }

    /// Candidate endpoints, in insertion order
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Latched endpoint
    #[must_use]
    pub fn active(&self) -> Option<Endpoint> {
        self.active
    }

    /// Whether the socket binding must be re-resolved
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Whether the sender was aborted
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Force the next posts through the primary socket until re-latched
    pub fn mark_stale(&mut self) {
        if !self.stale {
            tracing::debug!("socket binding to {:?} marked stale", self.active);
        }
        self.stale = true;
    }

    /// Latch the socket and endpoint a packet just arrived on
    pub fn relatch(&mut self, inbound: &Inbound) {
        self.socket = inbound.socket;
        self.stale = false;
        self.add_endpoints(&[inbound.endpoint]);
        self.active = Some(inbound.endpoint);
    }

    /// Add candidates, returning those not known before
    ///
    /// Unroutable endpoints are dropped.
    pub fn add_endpoints(&mut self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let mut added = Vec::new();
        for ep in endpoints {
            if ep.is_routable() && !self.endpoints.contains(ep) {
                self.endpoints.push(*ep);
                added.push(*ep);
            }
        }
        added
    }

    /// Make the next post go to every candidate
    pub fn set_resend_all(&mut self, resend_all: bool) {
        self.resend_all = resend_all;
    }

    /// Temporary sender on the same socket limited to `endpoints`
    #[must_use]
    pub fn narrowed(&self, endpoints: &[Endpoint]) -> Self {
        let mut sender = Self::new(self.socket);
        sender.endpoints = endpoints.to_vec();
        sender
    }

    /// Temporary sender on the same socket limited to UDP candidates
    #[must_use]
    pub fn udp_only(&self) -> Self {
        let udp: Vec<Endpoint> = self.endpoints.iter().copied().filter(Endpoint::is_udp).collect();
        self.narrowed(&udp)
    }

    /// Queue `packet` for the active endpoint, or for all candidates
    ///
    /// Returns false when there is nowhere to send.
    pub fn post(&mut self, packet: Packet, out: &mut VecDeque<Transmit>) -> bool {
        if self.aborted {
            return false;
        }
        let destinations = match self.active {
            Some(ep) if !self.resend_all => vec![ep],
            _ => self.endpoints.clone(),
        };
        self.resend_all = false;
        if destinations.is_empty() {
            return false;
        }
        let socket = if self.stale {
            SocketRef::Primary
        } else {
            self.socket
        };
        tracing::trace!(
            "posting {:?} seq={} to {} endpoint(s)",
            packet.kind(),
            packet.header.seq,
            destinations.len()
        );
        out.push_back(Transmit {
            socket,
            destinations,
            packet,
        });
        true
    }

    /// Whether a probe is due, updating the per-sender backoff
    ///
    /// A probe is skipped while the candidate count is unchanged and the
    /// current interval has not elapsed. A changed candidate set resets the
    /// interval to `base`; an unchanged one doubles it.
    pub fn probe_due(&mut self, now: Instant, base: Duration) -> bool {
        let count = self.endpoints.len();
        match self.backoff.last {
            Some(last)
                if count == self.backoff.epcount
                    && now.saturating_duration_since(last) < self.backoff.interval =>
            {
                return false;
            }
            Some(_) if count == self.backoff.epcount => {
                self.backoff.interval = self.backoff.interval.saturating_mul(2);
            }
            _ => self.backoff.interval = base,
        }
        self.backoff.last = Some(now);
        self.backoff.epcount = count;
        true
    }

    /// Stop sending for good
    pub fn abort(&mut self) {
        self.aborted = true;
    }
}

/// Supplementary punched path toward one remote
#[derive(Debug, Default)]
pub enum Punched {
    /// Nothing opened
    #[default]
    Absent,
    /// Socket requested from the environment
    Creating,
    /// Socket open
    Ready {
        /// Local endpoint of the punched socket
        local: Endpoint,
        /// Sender to the party that triggered the punch
        sender: Sender,
        /// Sender to the connection's remote candidates through the same socket
        remote: Sender,
    },
}

impl Punched {
    /// Punched socket id once ready
    #[must_use]
    pub fn socket_id(&self) -> Option<SocketId> {
        match self {
            Self::Ready { sender, .. } => sender.socket().punched(),
            _ => None,
        }
    }

    /// Whether nothing has been opened or requested
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Abort the senders and return the socket to release
    pub fn take_socket(&mut self) -> Option<SocketId> {
        let socket = match self {
            Self::Ready { sender, remote, .. } => {
                sender.abort();
                remote.abort();
                sender.socket().punched()
            }
            _ => None,
        };
        *self = Self::Absent;
        socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::PortAddr;
    use crate::packet::PacketKind;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn ping() -> Packet {
        Packet::new(
            PacketKind::Heartbeat,
            PortAddr::new("a", 1),
            PortAddr::new("b", 1),
        )
    }

    #[test]
    fn test_add_endpoints_reports_only_new() {
        let mut sender = Sender::new(SocketRef::Primary);
        let added = sender.add_endpoints(&[ep("udp:10.0.0.1:1000"), ep("udp:0.0.0.0:1")]);
        assert_eq!(added, vec![ep("udp:10.0.0.1:1000")]);

        let added = sender.add_endpoints(&[ep("udp:10.0.0.1:1000"), ep("tcp:10.0.0.1:1000")]);
        assert_eq!(added, vec![ep("tcp:10.0.0.1:1000")]);
        assert_eq!(sender.endpoints().len(), 2);
    }

    #[test]
    fn test_post_sprays_until_latched() {
        let mut out = VecDeque::new();
        let mut sender = Sender::with_endpoints(
            SocketRef::Primary,
            &[ep("udp:10.0.0.1:1000"), ep("udp:10.0.0.2:1000")],
        );
        assert!(sender.post(ping(), &mut out));
        assert_eq!(out.pop_front().unwrap().destinations.len(), 2);

        sender.relatch(&Inbound {
            socket: SocketRef::Punched(SocketId(3)),
            endpoint: ep("udp:10.0.0.2:1000"),
        });
        sender.post(ping(), &mut out);
        let t = out.pop_front().unwrap();
        assert_eq!(t.destinations, vec![ep("udp:10.0.0.2:1000")]);
        assert_eq!(t.socket, SocketRef::Punched(SocketId(3)));

        sender.set_resend_all(true);
        sender.post(ping(), &mut out);
        assert_eq!(out.pop_front().unwrap().destinations.len(), 2);
        sender.post(ping(), &mut out);
        assert_eq!(out.pop_front().unwrap().destinations.len(), 1);
    }

    #[test]
    fn test_stale_binding_uses_primary_until_relatched() {
        let mut out = VecDeque::new();
        let inbound = Inbound {
            socket: SocketRef::Punched(SocketId(1)),
            endpoint: ep("udp:10.0.0.1:1000"),
        };
        let mut sender = Sender::from_inbound(&inbound);
        sender.mark_stale();
        sender.post(ping(), &mut out);
        assert_eq!(out.pop_front().unwrap().socket, SocketRef::Primary);

        sender.relatch(&inbound);
        assert!(!sender.is_stale());
        sender.post(ping(), &mut out);
        assert_eq!(out.pop_front().unwrap().socket, SocketRef::Punched(SocketId(1)));
    }

    #[test]
    fn test_empty_or_aborted_sender_posts_nothing() {
        let mut out = VecDeque::new();
        let mut sender = Sender::new(SocketRef::Primary);
        assert!(!sender.post(ping(), &mut out));

        sender.add_endpoints(&[ep("udp:10.0.0.1:1000")]);
        sender.abort();
        assert!(!sender.post(ping(), &mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn test_probe_backoff_doubles_and_resets() {
        let base = Duration::from_secs(1);
        let t0 = Instant::now();
        let mut sender = Sender::with_endpoints(SocketRef::Primary, &[ep("udp:10.0.0.1:1")]);

        assert!(sender.probe_due(t0, base));
        assert!(!sender.probe_due(t0 + Duration::from_millis(500), base));
        assert!(sender.probe_due(t0 + base, base));
        // interval is now 2s
        assert!(!sender.probe_due(t0 + Duration::from_millis(2500), base));
        assert!(sender.probe_due(t0 + Duration::from_secs(3), base));

        sender.add_endpoints(&[ep("udp:10.0.0.2:1")]);
        assert!(sender.probe_due(t0 + Duration::from_millis(3100), base));
        assert!(!sender.probe_due(t0 + Duration::from_millis(3200), base));
    }

    #[test]
    fn test_udp_only_filters_tcp() {
        let sender = Sender::with_endpoints(
            SocketRef::Primary,
            &[ep("tcp:10.0.0.1:1"), ep("udp:10.0.0.1:2")],
        );
        assert_eq!(sender.udp_only().endpoints(), &[ep("udp:10.0.0.1:2")]);
    }

    #[test]
    fn test_punched_take_socket() {
        let mut punched = Punched::Ready {
            local: ep("udp:192.0.2.1:7000"),
            sender: Sender::new(SocketRef::Punched(SocketId(9))),
            remote: Sender::new(SocketRef::Punched(SocketId(9))),
        };
        assert_eq!(punched.socket_id(), Some(SocketId(9)));
        assert_eq!(punched.take_socket(), Some(SocketId(9)));
        assert!(punched.is_absent());
        assert_eq!(punched.take_socket(), None);
    }
}
