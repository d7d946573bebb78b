//! Rendezvous through signaling peers.
//!
//! The caller resolves the target's signaling peers (cache first, then the
//! network), calls each one on its own backoff schedule and, after the
//! second call to the same peer, opens a punched socket to call it again
//! from a fresh port. A generic peer locator runs alongside once the
//! signaling path looks slow.
//!
//! The callee side keeps a [`CalledMap`]: a relayed call seen more than once
//! from the same relay endpoint gets a dynamic answer from a punched socket.

use crate::config::StackConfig;
use crate::endpoint::{Endpoint, PeerId, PeerInfo};
use crate::output::{LookupId, Outbox, PunchTicket, Request};
use crate::packet::Packet;
use crate::sender::{Inbound, Punched, Sender, SocketId, SocketRef};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The peer locator starts at this re-call tick
const LOCATOR_AFTER_TICKS: u32 = 3;

/// First tick at which unresponsive signaling peers are refreshed
const REFRESH_FROM_TICK: u32 = 2;

/// Calls to the same signaling peer before punching and backing off
const PUNCH_AFTER_CALLS: u32 = 2;

/// Copy of `packet` marked as sent from the punched socket at `local`
#[must_use]
pub fn dynamic_variant(packet: &Packet, local: Endpoint) -> Packet {
    let mut packet = packet.clone();
    packet.body.is_dynamic = true;
    packet.body.dynamics = vec![local];
    packet
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LookupKind {
    Cache,
    Network,
    Refresh,
}

#[derive(Debug)]
struct SnPeer {
    id: PeerId,
    sender: Sender,
    next_call: Instant,
    call_interval: Duration,
    next_resend: u32,
    call_times: u32,
    responded: bool,
    punched: Punched,
}

/// Generic locator used when signaling is slow or empty
#[derive(Debug)]
struct PeerLocator {
    started: bool,
    lookup: Option<LookupId>,
    interval: Duration,
    next_retry: Option<Instant>,
}

impl PeerLocator {
    fn new(interval: Duration) -> Self {
        Self {
            started: false,
            lookup: None,
            interval,
            next_retry: None,
        }
    }

    fn start(&mut self, target: &PeerId, out: &mut Outbox) {
        if self.started {
            return;
        }
        self.started = true;
        tracing::debug!("starting peer locator for {}", target);
        self.find(target, out);
    }

    fn find(&mut self, target: &PeerId, out: &mut Outbox) {
        let lookup = out.lookup_id();
        self.lookup = Some(lookup);
        self.next_retry = None;
        out.request(Request::FindPeer {
            lookup,
            peer: target.clone(),
        });
    }

    fn on_result(
        &mut self,
        lookup: LookupId,
        info: Option<PeerInfo>,
        now: Instant,
    ) -> Option<Vec<Endpoint>> {
        if self.lookup != Some(lookup) {
            return None;
        }
        self.lookup = None;
        if let Some(mut info) = info {
            info.retain_routable();
            if !info.endpoints.is_empty() {
                return Some(info.endpoints);
            }
        }
        self.next_retry = Some(now + self.interval);
        self.interval = self.interval.saturating_mul(2);
        None
    }
}

/// Caller-side rendezvous session
#[derive(Debug)]
pub struct SnCall {
    local: PeerId,
    target: PeerId,
    interval: Duration,
    peers: Vec<SnPeer>,
    resend_times: u32,
    next_tick: Option<Instant>,
    lookups: HashMap<LookupId, LookupKind>,
    find_interval: Duration,
    next_find: Option<Instant>,
    guard: Option<Instant>,
    responded_at: Option<Instant>,
    locator: PeerLocator,
}

impl SnCall {
    /// Start resolving the target's signaling peers from the local cache
    pub fn start(
        local: PeerId,
        target: PeerId,
        config: &StackConfig,
        now: Instant,
        out: &mut Outbox,
    ) -> Self {
        let mut call = Self {
            local,
            target,
            interval: config.try_connect_interval,
            peers: Vec::new(),
            resend_times: 0,
            next_tick: None,
            lookups: HashMap::new(),
            find_interval: config.try_find_sn_interval,
            next_find: None,
            guard: Some(now + config.try_find_sn_interval * 2),
            responded_at: None,
            locator: PeerLocator::new(config.try_find_sn_interval),
        };
        tracing::debug!("rendezvous toward {} started", call.target);
        let target = call.target.clone();
        call.find_sn(target, LookupKind::Cache, out);
        call
    }

    fn find_sn(&mut self, peer: PeerId, kind: LookupKind, out: &mut Outbox) {
        let lookup = out.lookup_id();
        self.lookups.insert(lookup, kind);
        out.request(Request::FindSn {
            lookup,
            peer,
            from_cache: kind == LookupKind::Cache,
        });
    }

    /// Signaling peers found so far
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether any signaling peer answered a call
    #[must_use]
    pub fn any_responded(&self) -> bool {
        self.responded_at.is_some()
    }

    /// When a signaling peer last answered
    #[must_use]
    pub fn responded_at(&self) -> Option<Instant> {
        self.responded_at
    }

    /// Re-call ticks run so far
    #[must_use]
    pub fn resend_times(&self) -> u32 {
        self.resend_times
    }

    /// Whether the peer locator has been started
    #[must_use]
    pub fn locator_started(&self) -> bool {
        self.locator.started
    }

    /// Earliest pending timer
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.next_tick,
            self.next_find,
            self.guard,
            self.locator.next_retry,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run every timer that is due
    pub fn handle_timeout(&mut self, now: Instant, call: &Packet, out: &mut Outbox) {
        if self.next_tick.is_some_and(|t| now >= t) {
            self.tick(now, call, out);
        }
        if self.next_find.is_some_and(|t| now >= t) {
            self.next_find = None;
            let target = self.target.clone();
            self.find_sn(target, LookupKind::Network, out);
            self.locator.start(&self.target, out);
            self.find_interval = self.find_interval.saturating_mul(2);
        }
        if self.guard.is_some_and(|t| now >= t) {
            self.guard = None;
            if self.peers.is_empty() {
                tracing::debug!("no signaling peer for {} yet, asking the network", self.target);
                let target = self.target.clone();
                self.find_sn(target, LookupKind::Network, out);
                self.locator.start(&self.target, out);
            }
        }
        if self.locator.next_retry.is_some_and(|t| now >= t) {
            let target = self.target.clone();
            self.locator.find(&target, out);
        }
    }

    /// Periodic re-call of every signaling peer
    fn tick(&mut self, now: Instant, call: &Packet, out: &mut Outbox) {
        if self.resend_times == LOCATOR_AFTER_TICKS {
            self.locator.start(&self.target, out);
        }
        let rt = self.resend_times as usize;
        if self.resend_times >= REFRESH_FROM_TICK && rt <= self.peers.len() {
            let stale = &self.peers[rt - 1];
            if !stale.responded {
                tracing::debug!("refreshing signaling peer {}", stale.id);
                let id = stale.id.clone();
                self.find_sn(id, LookupKind::Refresh, out);
            }
        }
        for i in 0..self.peers.len() {
            self.call_peer(i, now, call, out);
        }
        self.resend_times += 1;
        self.next_tick = Some(now + self.interval);
    }

    fn call_peer(&mut self, index: usize, now: Instant, call: &Packet, out: &mut Outbox) {
        let spread = u32::try_from(self.peers.len()).unwrap_or(u32::MAX).max(3);
        let resend_times = self.resend_times;
        let Some(peer) = self.peers.get_mut(index) else {
            return;
        };
        if now < peer.next_call {
            return;
        }
        peer.call_times += 1;
        let resend_all = resend_times == peer.next_resend;
        if resend_all {
            peer.next_resend += spread;
        }
        peer.sender.set_resend_all(resend_all);
        peer.sender.post(call.clone(), &mut out.transmits);

        if peer.call_times >= PUNCH_AFTER_CALLS {
            if peer.punched.is_absent() {
                peer.punched = Punched::Creating;
                out.request(Request::OpenPunchedSocket(PunchTicket::SnPeer(
                    peer.id.clone(),
                )));
            } else if let Punched::Ready { local, sender, .. } = &mut peer.punched {
                sender.post(dynamic_variant(call, *local), &mut out.transmits);
            }
        }
        if peer.call_times > PUNCH_AFTER_CALLS {
            peer.call_interval = peer.call_interval.saturating_mul(2);
        }
        peer.next_call = now + peer.call_interval;
    }

    /// Merge signaling peers and call the new ones
    ///
    /// The first batch runs a full tick and arms the periodic re-call; later
    /// arrivals are called immediately.
    pub fn add_peers(
        &mut self,
        infos: Vec<PeerInfo>,
        now: Instant,
        call: &Packet,
        out: &mut Outbox,
    ) -> usize {
        let first_batch = self.peers.is_empty();
        let start = self.peers.len();
        for mut info in infos {
            info.retain_routable();
            if info.peer_id == self.local || info.endpoints.is_empty() {
                continue;
            }
            if let Some(known) = self.peers.iter_mut().find(|p| p.id == info.peer_id) {
                known.sender.add_endpoints(&info.endpoints);
                continue;
            }
            let offset = u32::try_from(self.peers.len() - start).unwrap_or(u32::MAX);
            self.peers.push(SnPeer {
                sender: Sender::with_endpoints(SocketRef::Primary, &info.endpoints),
                id: info.peer_id,
                next_call: now,
                call_interval: self.interval,
                next_resend: self.resend_times + 3 + offset,
                call_times: 0,
                responded: false,
                punched: Punched::Absent,
            });
        }
        let added = self.peers.len() - start;
        if added == 0 {
            return 0;
        }
        tracing::debug!("{} new signaling peer(s) for {}", added, self.target);
        if first_batch {
            self.tick(now, call, out);
        } else {
            for i in start..self.peers.len() {
                self.call_peer(i, now, call, out);
            }
        }
        added
    }

    /// Resolver answer; returns false for unknown or superseded lookups
    pub fn on_sn_found(
        &mut self,
        lookup: LookupId,
        infos: Vec<PeerInfo>,
        now: Instant,
        call: &Packet,
        out: &mut Outbox,
    ) -> bool {
        let Some(kind) = self.lookups.remove(&lookup) else {
            return false;
        };
        tracing::debug!("{:?} lookup returned {} signaling peer(s)", kind, infos.len());
        if infos.is_empty() {
            self.locator.start(&self.target, out);
        }
        self.add_peers(infos, now, call, out);
        if kind != LookupKind::Refresh && self.next_find.is_none() {
            self.next_find = Some(now + self.find_interval);
        }
        true
    }

    /// Peer locator answer; returns endpoints once it finds some
    pub fn on_peer_found(
        &mut self,
        lookup: LookupId,
        info: Option<PeerInfo>,
        now: Instant,
    ) -> Option<Vec<Endpoint>> {
        self.locator.on_result(lookup, info, now)
    }

    /// Record a call response from a signaling peer
    pub fn on_call_resp(&mut self, inbound: &Inbound, packet: &Packet, now: Instant) {
        let peer = match &packet.body.responder {
            Some(id) => self.peers.iter_mut().find(|p| &p.id == id),
            None => self
                .peers
                .iter_mut()
                .find(|p| p.sender.endpoints().contains(&inbound.endpoint)),
        };
        if let Some(peer) = peer {
            if !peer.responded {
                tracing::debug!("signaling peer {} responded", peer.id);
            }
            peer.responded = true;
        }
        self.responded_at = Some(now);
    }

    /// A punched socket requested for a signaling peer opened or failed
    ///
    /// A ready socket calls the signaling peer through it at once. Returns
    /// false when nobody wanted it; the caller must release it then.
    pub fn on_punched(
        &mut self,
        sn: &PeerId,
        socket: Option<(SocketId, Endpoint)>,
        remote_candidates: &[Endpoint],
        call: &Packet,
        out: &mut Outbox,
    ) -> bool {
        let Some(peer) = self.peers.iter_mut().find(|p| &p.id == sn) else {
            return false;
        };
        if !matches!(peer.punched, Punched::Creating) {
            return false;
        }
        peer.punched = match socket {
            Some((id, local)) => {
                tracing::debug!("punched socket {} ready toward signaling peer {}", id, sn);
                let mut sender =
                    Sender::with_endpoints(SocketRef::Punched(id), peer.sender.endpoints());
                sender.post(dynamic_variant(call, local), &mut out.transmits);
                Punched::Ready {
                    local,
                    sender,
                    remote: Sender::with_endpoints(SocketRef::Punched(id), remote_candidates),
                }
            }
            None => Punched::Absent,
        };
        true
    }

    /// A punched socket closed underneath
    pub fn on_socket_closed(&mut self, socket: SocketId) {
        for peer in &mut self.peers {
            if peer.punched.socket_id() == Some(socket) {
                peer.punched = Punched::Absent;
            }
        }
    }

    /// Senders to the remote through punched sockets
    pub fn punched_remotes_mut(&mut self) -> impl Iterator<Item = &mut Sender> {
        self.peers.iter_mut().filter_map(|p| match &mut p.punched {
            Punched::Ready { remote, .. } => Some(remote),
            _ => None,
        })
    }

    /// Tear the session down, releasing every punched socket except `keep`
    pub fn stop(mut self, keep: Option<SocketId>, out: &mut Outbox) {
        for peer in &mut self.peers {
            peer.sender.abort();
            if let Some(socket) = peer.punched.take_socket() {
                if Some(socket) != keep {
                    out.request(Request::ReleaseSocket(socket));
                }
            }
        }
        tracing::debug!(
            "rendezvous toward {} stopped after {} tick(s)",
            self.target,
            self.resend_times
        );
    }
}

#[derive(Debug, Default)]
struct CalledEntry {
    times: u32,
    responded: bool,
    punched: Punched,
}

/// Callee-side record of relayed calls per relay endpoint
#[derive(Debug, Default)]
pub struct CalledMap {
    entries: HashMap<Endpoint, CalledEntry>,
}

impl CalledMap {
    /// Empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a relayed call from `from`
    ///
    /// The second call from the same endpoint asks for a punched socket.
    /// Returns the punched local endpoint when a dynamic answer should be
    /// posted now.
    pub fn on_called(
        &mut self,
        from: Endpoint,
        inbound_dynamic: bool,
        out: &mut Outbox,
    ) -> Option<Endpoint> {
        let entry = self.entries.entry(from).or_default();
        entry.times += 1;
        if entry.times > 1 && entry.punched.is_absent() {
            tracing::debug!("repeated call relayed from {}, punching", from);
            entry.punched = Punched::Creating;
            out.request(Request::OpenPunchedSocket(PunchTicket::Called(from)));
        }
        entry.responded |= inbound_dynamic;
        Self::pending(entry)
    }

    fn pending(entry: &CalledEntry) -> Option<Endpoint> {
        match &entry.punched {
            Punched::Ready { local, .. } if !entry.responded => Some(*local),
            _ => None,
        }
    }

    /// A punched socket for `from` opened or failed
    ///
    /// Returns false when nobody wanted it. On success, returns the local
    /// endpoint through `pending` if a dynamic answer is owed.
    pub fn on_punched(
        &mut self,
        from: Endpoint,
        socket: Option<(SocketId, Endpoint)>,
        remote_candidates: &[Endpoint],
    ) -> (bool, Option<Endpoint>) {
        let Some(entry) = self.entries.get_mut(&from) else {
            return (false, None);
        };
        if !matches!(entry.punched, Punched::Creating) {
            return (false, None);
        }
        entry.punched = match socket {
            Some((id, local)) => Punched::Ready {
                local,
                sender: Sender::with_endpoints(SocketRef::Punched(id), &[from]),
                remote: Sender::with_endpoints(SocketRef::Punched(id), remote_candidates),
            },
            None => Punched::Absent,
        };
        (true, Self::pending(entry))
    }

    /// Post `packet` back to the relay at `from` through its punched socket
    pub fn post(&mut self, from: Endpoint, packet: Packet, out: &mut Outbox) {
        if let Some(CalledEntry {
            punched: Punched::Ready { sender, .. },
            ..
        }) = self.entries.get_mut(&from)
        {
            sender.post(packet, &mut out.transmits);
        }
    }

    /// A punched socket closed underneath
    pub fn on_socket_closed(&mut self, socket: SocketId) {
        for entry in self.entries.values_mut() {
            if entry.punched.socket_id() == Some(socket) {
                entry.punched = Punched::Absent;
            }
        }
    }

    /// Senders to the remote through punched sockets
    pub fn punched_remotes_mut(&mut self) -> impl Iterator<Item = &mut Sender> {
        self.entries.values_mut().filter_map(|e| match &mut e.punched {
            Punched::Ready { remote, .. } => Some(remote),
            _ => None,
        })
    }

    /// Release every punched socket except `keep` and forget all entries
    pub fn stop(&mut self, keep: Option<SocketId>, out: &mut Outbox) {
        for (_, mut entry) in self.entries.drain() {
            if let Some(socket) = entry.punched.take_socket() {
                if Some(socket) != keep {
                    out.request(Request::ReleaseSocket(socket));
                }
            }
        }
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

    fn config() -> StackConfig {
        StackConfig {
            try_connect_interval: Duration::from_secs(1),
            try_find_sn_interval: Duration::from_secs(1),
            ..StackConfig::default()
        }
    }

    fn call_packet() -> Packet {
        Packet::new(
            PacketKind::CallReq,
            PortAddr::new("alice", 40000),
            PortAddr::new("bob", 80),
        )
    }

    fn sn(id: &str, last: u8) -> PeerInfo {
        PeerInfo::new(id, vec![ep(&format!("udp:192.0.2.{last}:7000"))])
    }

    fn start(now: Instant, out: &mut Outbox) -> (SnCall, LookupId) {
        let call = SnCall::start(
            PeerId::new("alice"),
            PeerId::new("bob"),
            &config(),
            now,
            out,
        );
        let lookup = match out.requests.pop_front() {
            Some(Request::FindSn {
                lookup,
                from_cache: true,
                ..
            }) => lookup,
            other => panic!("expected cache lookup, got {other:?}"),
        };
        (call, lookup)
    }

    fn calls_to(out: &mut Outbox) -> Vec<Endpoint> {
        out.transmits
            .drain(..)
            .filter(|t| t.packet.kind() == PacketKind::CallReq)
            .flat_map(|t| t.destinations)
            .collect()
    }

    #[test]
    fn test_first_batch_calls_every_peer_and_arms_tick() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, lookup) = start(t0, &mut out);

        assert!(call.on_sn_found(lookup, vec![sn("s1", 1), sn("s2", 2)], t0, &call_packet(), &mut out));
        assert_eq!(call.peer_count(), 2);
        assert_eq!(calls_to(&mut out).len(), 2);
        assert_eq!(call.resend_times(), 1);
        assert!(call.poll_timeout().is_some_and(|t| t <= t0 + Duration::from_secs(1)));

        // duplicate lookup result is ignored
        assert!(!call.on_sn_found(lookup, vec![sn("s3", 3)], t0, &call_packet(), &mut out));
    }

    #[test]
    fn test_late_peer_called_immediately() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, lookup) = start(t0, &mut out);
        call.on_sn_found(lookup, vec![sn("s1", 1)], t0, &call_packet(), &mut out);
        calls_to(&mut out);

        let later = t0 + Duration::from_millis(300);
        let added = call.add_peers(vec![sn("s1", 1), sn("s2", 2)], later, &call_packet(), &mut out);
        assert_eq!(added, 1);
        assert_eq!(calls_to(&mut out), vec![ep("udp:192.0.2.2:7000")]);
    }

    #[test]
    fn test_each_peer_backs_off_independently() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, lookup) = start(t0, &mut out);
        call.on_sn_found(lookup, vec![sn("s1", 1)], t0, &call_packet(), &mut out);

        let mut call_times = Vec::new();
        for s in 1..=12u64 {
            let now = t0 + Duration::from_secs(s);
            call.handle_timeout(now, &call_packet(), &mut out);
            if out
                .transmits
                .iter()
                .any(|t| t.packet.kind() == PacketKind::CallReq && !t.packet.body.is_dynamic)
            {
                call_times.push(s);
            }
            out.transmits.clear();
        }
        // called at 0, 1, 2, then the interval doubles: 4, 8
        assert_eq!(call_times, vec![1, 2, 4, 8]);
    }

    #[test]
    fn test_second_call_requests_punched_socket() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, lookup) = start(t0, &mut out);
        call.on_sn_found(lookup, vec![sn("s1", 1)], t0, &call_packet(), &mut out);
        assert!(!out
            .requests
            .iter()
            .any(|r| matches!(r, Request::OpenPunchedSocket(_))));

        call.handle_timeout(t0 + Duration::from_secs(1), &call_packet(), &mut out);
        assert!(out.requests.iter().any(|r| matches!(
            r,
            Request::OpenPunchedSocket(PunchTicket::SnPeer(id)) if id.as_str() == "s1"
        )));

        let local = ep("udp:198.51.100.2:50000");
        out.transmits.clear();
        assert!(call.on_punched(
            &PeerId::new("s1"),
            Some((SocketId(4), local)),
            &[],
            &call_packet(),
            &mut out
        ));
        // the fresh socket calls right away, without waiting for the next tick
        let first = out.transmits.pop_front().unwrap();
        assert!(out.transmits.is_empty());
        assert_eq!(first.socket, SocketRef::Punched(SocketId(4)));
        assert!(first.packet.body.is_dynamic);
        assert_eq!(first.destinations, vec![ep("udp:192.0.2.1:7000")]);

        call.handle_timeout(t0 + Duration::from_secs(2), &call_packet(), &mut out);
        let dynamic: Vec<_> = out
            .transmits
            .iter()
            .filter(|t| t.packet.body.is_dynamic)
            .collect();
        assert_eq!(dynamic.len(), 1);
        assert_eq!(dynamic[0].socket, SocketRef::Punched(SocketId(4)));
        assert_eq!(dynamic[0].packet.body.dynamics, vec![local]);

        out.requests.clear();
        call.stop(None, &mut out);
        assert_eq!(out.requests.pop_front(), Some(Request::ReleaseSocket(SocketId(4))));
    }

    #[test]
    fn test_empty_result_starts_locator_and_retries() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, lookup) = start(t0, &mut out);
        call.on_sn_found(lookup, Vec::new(), t0, &call_packet(), &mut out);
        assert!(call.locator_started());
        let locate = match out.requests.pop_front() {
            Some(Request::FindPeer { lookup, .. }) => lookup,
            other => panic!("expected locator lookup, got {other:?}"),
        };
        assert!(call.on_peer_found(locate, None, t0).is_none());
        call.handle_timeout(t0 + Duration::from_secs(1), &call_packet(), &mut out);
        let retry = out
            .requests
            .iter()
            .find_map(|r| match r {
                Request::FindPeer { lookup, .. } => Some(*lookup),
                _ => None,
            })
            .unwrap();
        let found = call.on_peer_found(retry, Some(sn("bob", 9)), t0 + Duration::from_secs(1));
        assert_eq!(found, Some(vec![ep("udp:192.0.2.9:7000")]));
    }

    #[test]
    fn test_guard_asks_network_when_cache_silent() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, _) = start(t0, &mut out);
        call.handle_timeout(t0 + Duration::from_secs(2), &call_packet(), &mut out);
        assert!(out.requests.iter().any(|r| matches!(
            r,
            Request::FindSn {
                from_cache: false,
                ..
            }
        )));
        assert!(call.locator_started());
    }

    #[test]
    fn test_call_resp_marks_responder() {
        let t0 = Instant::now();
        let mut out = Outbox::default();
        let (mut call, lookup) = start(t0, &mut out);
        call.on_sn_found(lookup, vec![sn("s1", 1)], t0, &call_packet(), &mut out);
        assert!(!call.any_responded());

        let mut resp = call_packet();
        resp.header.kind = PacketKind::CallResp;
        let inbound = Inbound {
            socket: SocketRef::Primary,
            endpoint: ep("udp:192.0.2.1:7000"),
        };
        call.on_call_resp(&inbound, &resp, t0);
        assert!(call.any_responded());
        assert!(call.peers[0].responded);
    }

    #[test]
    fn test_called_map_escalates_on_repeat() {
        let mut out = Outbox::default();
        let mut called = CalledMap::new();
        let relay = ep("udp:192.0.2.1:7000");
        assert_eq!(called.on_called(relay, false, &mut out), None);
        assert!(out.requests.is_empty());

        assert_eq!(called.on_called(relay, false, &mut out), None);
        assert_eq!(
            out.requests.pop_front(),
            Some(Request::OpenPunchedSocket(PunchTicket::Called(relay)))
        );

        let local = ep("udp:198.51.100.2:50001");
        let (wanted, pending) = called.on_punched(relay, Some((SocketId(7), local)), &[]);
        assert!(wanted);
        assert_eq!(pending, Some(local));

        // a dynamic call from the same relay means the punch went through
        assert_eq!(called.on_called(relay, true, &mut out), None);
        called.stop(Some(SocketId(7)), &mut out);
        assert!(out.requests.is_empty());
    }
}
