//! Remote black list.
//!
//! Entries forbid an IP, a peer id, or a peer id only when seen on a given
//! IP. Every entry carries a deadline and stops matching once it passes.

use crate::endpoint::PeerId;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// How long an entry lasts when no duration is given
pub const DEFAULT_FORBID_DURATION: Duration = Duration::from_millis(600_809);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Rule {
    Ip(IpAddr),
    Peer(PeerId),
    PeerOnIp(PeerId, IpAddr),
}

/// Black list consulted before any inbound packet is processed
#[derive(Debug, Default)]
pub struct RemoteFilter {
    rules: HashMap<Rule, Instant>,
}

impl RemoteFilter {
    /// Empty filter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forbid every packet from `ip`
    pub fn forbid_ip(&mut self, ip: IpAddr, now: Instant, duration: Option<Duration>) {
        self.insert(Rule::Ip(ip), now, duration);
    }

    /// Forbid `peer` on any address
    pub fn forbid_peer(&mut self, peer: PeerId, now: Instant, duration: Option<Duration>) {
        self.insert(Rule::Peer(peer), now, duration);
    }

    /// Forbid `peer` only when it arrives from `ip`
    pub fn forbid_peer_on_ip(
        &mut self,
        peer: PeerId,
        ip: IpAddr,
        now: Instant,
        duration: Option<Duration>,
    ) {
        self.insert(Rule::PeerOnIp(peer, ip), now, duration);
    }

    /// Lift every rule naming `peer`
    pub fn allow_peer(&mut self, peer: &PeerId) {
        self.rules.retain(|rule, _| match rule {
            Rule::Peer(p) | Rule::PeerOnIp(p, _) => p != peer,
            Rule::Ip(_) => true,
        });
    }

    /// Lift the rule on `ip`
    pub fn allow_ip(&mut self, ip: IpAddr) {
        self.rules.remove(&Rule::Ip(ip));
    }

    fn insert(&mut self, rule: Rule, now: Instant, duration: Option<Duration>) {
        let deadline = now + duration.unwrap_or(DEFAULT_FORBID_DURATION);
        tracing::debug!("forbidding {:?} until {:?}", rule, deadline);
        self.rules.insert(rule, deadline);
    }

    /// Whether a packet from `peer` at `ip` must be dropped
    #[must_use]
    pub fn is_forbidden(&self, ip: IpAddr, peer: &PeerId, now: Instant) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let live = |rule: &Rule| self.rules.get(rule).is_some_and(|deadline| *deadline > now);
        live(&Rule::Ip(ip))
            || live(&Rule::Peer(peer.clone()))
            || live(&Rule::PeerOnIp(peer.clone(), ip))
    }

    /// Drop expired entries
    pub fn purge(&mut self, now: Instant) {
        self.rules.retain(|_, deadline| *deadline > now);
    }

    /// Number of entries, expired ones included until purged
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
