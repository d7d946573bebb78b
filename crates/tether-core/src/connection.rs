//! Connection state machine.
//!
//! One [`Connection`] per connect or accept attempt. Every stimulus enters
//! through a single method (`connect`, `send`, `close`, `handle_packet`,
//! `handle_timeout` and the `handle_*` results of environment requests) and
//! runs to completion; outputs are drained with the `poll_*` methods.
//!
//! ```text
//!            connect                     Syn / CalledReq
//!   Init ───────────────► WaitAck   Init ───────────────► WaitAckAck
//!                            │ SynAck                         │ SynAckAck
//!                            └──────────► Establish ◄─────────┘
//!                                          │      │ peer Fin
//!                                    close │      └──► CloseWait ──close──► LastAck
//!                                          ▼                                   │
//!                FinWait1 ──acked──► FinWait2 ──peer Fin──► TimeWait ──► Closed ◄┘
//!                    └──peer Fin──► Closing ──acked──────────┘
//! ```
//!
//! Any active state may fail into `Break`, which reports the error once and
//! moves on to `Closed`.

use crate::config::ConnectionOptions;
use crate::early_data::EarlyData;
use crate::endpoint::{Endpoint, PeerInfo, PortAddr, Protocol, SessionId, VPort};
use crate::error::{ConnectError, Error};
use crate::heartbeat::Heartbeat;
use crate::output::{Event, LookupId, Outbox, PunchTicket, Request};
use crate::packet::{Body, Header, Packet, PacketKind};
use crate::sender::{Inbound, Sender, SocketId, SocketRef, Transmit};
use crate::seq::{Seq, SeqCounter};
use crate::sn_call::{CalledMap, SnCall, dynamic_variant};
use crate::stack::Context;
use crate::transfer::{Link, Transfer, TransferEvent, TransferParams};
use crate::try_connect::{Evidence, TryConnect, diagnose};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, nothing sent
    Init,
    /// Caller: handshake sent, waiting for the reply
    WaitAck,
    /// Callee: reply sent, waiting for its acknowledgement
    WaitAckAck,
    /// Handshake complete
    Establish,
    /// Local half-close sent
    FinWait1,
    /// Local half-close acknowledged, waiting for the peer's
    FinWait2,
    /// Both sides half-closed, ours not yet acknowledged
    Closing,
    /// Lingering before close
    TimeWait,
    /// Peer half-closed while we were open
    CloseWait,
    /// Local half-close sent after the peer's
    LastAck,
    /// Terminal
    Closed,
    /// Failed; passes straight on to `Closed`
    Break,
}

impl State {
    /// Whether the connection is finished
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Break)
    }

    /// Whether the handshake is in progress
    #[must_use]
    pub const fn is_handshaking(self) -> bool {
        matches!(self, Self::WaitAck | Self::WaitAckAck)
    }

    /// Whether the application may still send
    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Establish | Self::CloseWait)
    }

    /// Check if a transition to `to` is valid
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        match (self, to) {
            (Self::Closed, _) => false,
            (Self::Break, Self::Closed) => true,
            (Self::Break, _) => false,
            (_, Self::Closed) => true,

            (Self::Init, Self::WaitAck | Self::WaitAckAck) => true,
            (Self::Init, _) => false,

            (_, Self::Break) => true,

            (Self::WaitAck | Self::WaitAckAck, Self::Establish) => true,
            (Self::Establish, Self::FinWait1 | Self::CloseWait) => true,
            (Self::FinWait1, Self::FinWait2 | Self::Closing) => true,
            (Self::FinWait2 | Self::Closing, Self::TimeWait) => true,
            (Self::CloseWait, Self::LastAck) => true,

            _ => false,
        }
    }
}

/// Which side started the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Local `connect`
    Connect,
    /// Accepted by a listener
    Accept,
}

/// Remote to connect to, with any endpoints already known for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Remote peer and vport
    pub addr: PortAddr,
    /// Seed candidate endpoints
    pub endpoints: Vec<Endpoint>,
}

impl ConnectTarget {
    /// Target with no known endpoints
    #[must_use]
    pub fn new(addr: PortAddr) -> Self {
        Self {
            addr,
            endpoints: Vec::new(),
        }
    }

    /// Add seed endpoints
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: Vec<Endpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }
}

/// Cached replies, re-sent when the peer repeats itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ResponseKey {
    SynAck,
    SynAckAck,
    CalledResp { dynamic: bool },
}

/// Session pair used to tag log lines
struct Tag(SessionId, Option<SessionId>);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.1 {
            Some(remote) => write!(f, "<{}-{}>", self.0, remote),
            None => write!(f, "<{}-?>", self.0),
        }
    }
}

/// A connection attempt and, once established, the connection itself
#[derive(Debug)]
pub struct Connection {
    ctx: Arc<Context>,
    options: ConnectionOptions,
    origin: Origin,
    state: State,
    local: PortAddr,
    local_session: SessionId,
    remote: Option<PortAddr>,
    remote_session: Option<SessionId>,
    self_connect: bool,
    use_tcp: bool,
    seq: SeqCounter,
    expected: Seq,
    sender: Option<Sender>,
    responses: HashMap<ResponseKey, Packet>,
    early: EarlyData,
    try_connect: Option<TryConnect>,
    sn_call: Option<SnCall>,
    called: CalledMap,
    heartbeat: Option<Heartbeat>,
    transfer: Option<Box<dyn Transfer>>,
    transfer_events: VecDeque<TransferEvent>,
    linger: Option<Instant>,
    last_send: Instant,
    error_reported: bool,
    watched: Option<SocketRef>,
    out: Outbox,
}

impl Connection {
    fn new(
        ctx: Arc<Context>,
        origin: Origin,
        vport: VPort,
        local_session: SessionId,
        options: ConnectionOptions,
        now: Instant,
    ) -> Self {
        let local = PortAddr::new(ctx.peer_id.clone(), vport);
        Self {
            ctx,
            options,
            origin,
            state: State::Init,
            local,
            local_session,
            remote: None,
            remote_session: None,
            self_connect: false,
            use_tcp: false,
            seq: SeqCounter::random(),
            expected: Seq::ZERO,
            sender: None,
            responses: HashMap::new(),
            early: EarlyData::new(),
            try_connect: None,
            sn_call: None,
            called: CalledMap::new(),
            heartbeat: None,
            transfer: None,
            transfer_events: VecDeque::new(),
            linger: None,
            last_send: now,
            error_reported: false,
            watched: None,
            out: Outbox::default(),
        }
    }

    /// New outgoing connection bound to `vport`, waiting for `connect`
    #[must_use]
    pub fn outgoing(
        ctx: Arc<Context>,
        vport: VPort,
        session: SessionId,
        options: ConnectionOptions,
        now: Instant,
    ) -> Self {
        Self::new(ctx, Origin::Connect, vport, session, options, now)
    }

    /// New incoming connection from `remote`, waiting for its first packet
    #[must_use]
    pub fn incoming(
        ctx: Arc<Context>,
        vport: VPort,
        session: SessionId,
        remote: PortAddr,
        remote_session: Option<SessionId>,
        options: ConnectionOptions,
        now: Instant,
    ) -> Self {
        let mut conn = Self::new(ctx, Origin::Accept, vport, session, options, now);
        conn.remote = Some(remote);
        conn.remote_session = remote_session;
        conn
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Which side started the connection
    #[must_use]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Local address
    #[must_use]
    pub fn local(&self) -> &PortAddr {
        &self.local
    }

    /// Local session id
    #[must_use]
    pub fn local_session(&self) -> SessionId {
        self.local_session
    }

    /// Remote address, once known
    #[must_use]
    pub fn remote(&self) -> Option<&PortAddr> {
        self.remote.as_ref()
    }

    /// Remote session id, once known
    #[must_use]
    pub fn remote_session(&self) -> Option<SessionId> {
        self.remote_session
    }

    /// Whether the connection runs over a stream socket
    #[must_use]
    pub fn use_tcp(&self) -> bool {
        self.use_tcp
    }

    /// Endpoint the remote is currently reached at
    #[must_use]
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        self.sender.as_ref().and_then(Sender::active)
    }

    /// Candidate endpoints known for the remote
    #[must_use]
    pub fn candidates(&self) -> &[Endpoint] {
        self.sender.as_ref().map_or(&[], Sender::endpoints)
    }

    /// Whether the rendezvous session is running
    #[must_use]
    pub fn is_rendezvous_active(&self) -> bool {
        self.sn_call.is_some()
    }

    /// Whether the candidate prober is running
    #[must_use]
    pub fn is_probing(&self) -> bool {
        self.try_connect.is_some()
    }

    /// Stream packets buffered before establishment
    #[must_use]
    pub fn early_len(&self) -> usize {
        self.early.len()
    }

    fn tag(&self) -> Tag {
        Tag(self.local_session, self.remote_session)
    }

    fn is_dynamic(&self) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|s| s.socket().punched().is_some())
    }

    // ========================================================================
    // Application calls
    // ========================================================================

    /// Start connecting to `target`
    ///
    /// Completion is reported through [`Event::Connected`] or
    /// [`Event::Error`].
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyConnected` if the connection left `Init`, or
    /// `Error::InvalidState` on an accepted connection.
    pub fn connect(&mut self, target: ConnectTarget, now: Instant) -> Result<(), Error> {
        if self.state != State::Init {
            return Err(Error::AlreadyConnected);
        }
        if self.origin != Origin::Connect {
            return Err(Error::InvalidState(self.state));
        }
        self.self_connect = target.addr.peer == self.ctx.peer_id;
        let mut sender = Sender::new(SocketRef::Primary);
        sender.add_endpoints(&target.endpoints);
        if self.self_connect {
            sender.add_endpoints(&self.ctx.endpoints);
        }
        tracing::info!(
            "{} connecting {} -> {} with {} seed endpoint(s)",
            self.tag(),
            self.local,
            target.addr,
            sender.endpoints().len()
        );
        self.remote = Some(target.addr);
        self.sender = Some(sender);
        self.transition(State::WaitAck, now);
        Ok(())
    }

    /// Send application bytes, returning how many were accepted
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless established or in close-wait.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<usize, Error> {
        if !self.state.can_send() {
            return Err(Error::InvalidState(self.state));
        }
        let accepted = self
            .with_transfer(now, |t, link| t.send(link, data))
            .unwrap_or(0);
        self.process_transfer_events(now);
        Ok(accepted)
    }

    /// Close the connection
    ///
    /// A forced close goes straight to `Closed`. Otherwise connections
    /// still handshaking close at once, and established ones begin the
    /// half-close sequence. Closing a closed connection does nothing.
    pub fn close(&mut self, force: bool, now: Instant) {
        match self.state {
            State::Closed | State::Break => return,
            _ if force => {
                tracing::info!("{} force closed in {:?}", self.tag(), self.state);
                self.transition(State::Closed, now);
            }
            State::Init | State::WaitAck | State::WaitAckAck => {
                self.transition(State::Closed, now);
            }
            State::Establish => self.transition(State::FinWait1, now),
            State::CloseWait => self.transition(State::LastAck, now),
            _ => {}
        }
        self.process_transfer_events(now);
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Next packet to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.out.transmits.pop_front()
    }

    /// Next application notification
    pub fn poll_event(&mut self) -> Option<Event> {
        self.out.events.pop_front()
    }

    /// Next environment request
    pub fn poll_request(&mut self) -> Option<Request> {
        self.out.requests.pop_front()
    }

    /// Earliest time `handle_timeout` has work to do
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state.is_terminal() {
            return None;
        }
        [
            self.try_connect.as_ref().map(TryConnect::poll_timeout),
            self.sn_call.as_ref().and_then(SnCall::poll_timeout),
            self.heartbeat.as_ref().map(Heartbeat::poll_timeout),
            self.transfer.as_ref().and_then(|t| t.poll_timeout()),
            self.linger,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run every timer that is due
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        if self.try_connect.as_ref().is_some_and(|tc| tc.is_due(now)) {
            self.probe(now);
        }
        if self.sn_call.is_some() {
            let call = self.call_packet();
            if let Some(sn) = self.sn_call.as_mut() {
                sn.handle_timeout(now, &call, &mut self.out);
            }
        }
        self.heartbeat_tick(now);
        if self.state.is_terminal() {
            return;
        }
        if self
            .transfer
            .as_ref()
            .and_then(|t| t.poll_timeout())
            .is_some_and(|t| now >= t)
        {
            self.with_transfer(now, |t, link| t.handle_timeout(link));
            self.process_transfer_events(now);
        }
        if self.linger.is_some_and(|t| now >= t) {
            self.transition(State::Closed, now);
        }
    }

    // ========================================================================
    // Environment results
    // ========================================================================

    /// Signaling peers resolved for a `FindSn` request
    pub fn handle_sn_found(&mut self, lookup: LookupId, peers: Vec<PeerInfo>, now: Instant) {
        if self.sn_call.is_none() {
            return;
        }
        let call = self.call_packet();
        if let Some(sn) = self.sn_call.as_mut() {
            sn.on_sn_found(lookup, peers, now, &call, &mut self.out);
        }
    }

    /// Result of a `FindPeer` request
    pub fn handle_peer_found(&mut self, lookup: LookupId, info: Option<PeerInfo>, now: Instant) {
        let Some(sn) = self.sn_call.as_mut() else {
            return;
        };
        if let Some(endpoints) = sn.on_peer_found(lookup, info, now) {
            if self.state == State::WaitAck {
                tracing::debug!("{} peer locator found {} endpoint(s)", self.tag(), endpoints.len());
                self.add_remote_endpoints(&endpoints, &[], now);
            }
        }
    }

    /// A punched socket requested with `ticket` opened (or failed to)
    pub fn handle_punched_socket(
        &mut self,
        ticket: PunchTicket,
        socket: Option<(SocketId, Endpoint)>,
        now: Instant,
    ) {
        let candidates = self.candidates().to_vec();
        let wanted = if self.state.is_terminal() {
            false
        } else {
            match &ticket {
                PunchTicket::SnPeer(sn) => {
                    let call = self.call_packet();
                    self.sn_call.as_mut().is_some_and(|rendezvous| {
                        rendezvous.on_punched(sn, socket, &candidates, &call, &mut self.out)
                    })
                }
                PunchTicket::Called(from) => {
                    let (wanted, pending) = self.called.on_punched(*from, socket, &candidates);
                    if let Some(local) = pending {
                        self.post_dynamic_called(*from, local);
                    }
                    wanted
                }
            }
        };
        if !wanted {
            if let Some((id, _)) = socket {
                tracing::debug!("{} punched socket {} no longer wanted", self.tag(), id);
                self.out.request(Request::ReleaseSocket(id));
            }
        }
        // a fresh path is worth probing right away
        if wanted && socket.is_some() && self.try_connect.is_some() {
            self.probe_punched(now);
        }
    }

    /// A socket closed underneath
    pub fn handle_socket_closed(&mut self, socket: SocketRef, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        if self.sender.as_ref().is_some_and(|s| s.socket() == socket) {
            tracing::warn!("{} socket {:?} closed", self.tag(), socket);
            self.fail(ConnectError::TransportClosed, now);
            return;
        }
        if let Some(id) = socket.punched() {
            if let Some(sn) = self.sn_call.as_mut() {
                sn.on_socket_closed(id);
            }
            self.called.on_socket_closed(id);
        }
    }

    /// A watched stream socket drained its send buffer
    pub fn handle_socket_drained(&mut self, socket: SocketRef, now: Instant) {
        if self.watched != Some(socket) {
            return;
        }
        self.with_transfer(now, |t, link| t.on_drain(link));
        self.process_transfer_events(now);
    }

    // ========================================================================
    // Inbound packets
    // ========================================================================

    /// Process a packet routed to this connection
    pub fn handle_packet(&mut self, inbound: Inbound, packet: Packet, now: Instant) {
        if self.state.is_terminal() {
            tracing::trace!("{} dropping {:?} after close", self.tag(), packet.kind());
            return;
        }
        // a bound connection has no remote until connect() names one
        if self.state == State::Init && self.origin == Origin::Connect {
            tracing::debug!("{} dropping {:?} before connect", self.tag(), packet.kind());
            return;
        }
        tracing::trace!(
            "{} {:?} seq={} from {} in {:?}",
            self.tag(),
            packet.kind(),
            packet.header.seq,
            inbound.endpoint,
            self.state
        );
        if let Some(hb) = self.heartbeat.as_mut() {
            hb.on_recv(now);
        }
        match packet.kind() {
            PacketKind::CalledReq => self.on_called(&inbound, &packet, now),
            PacketKind::CallResp => self.on_call_resp(&inbound, &packet, now),
            _ => {
                self.refresh_binding(&inbound);
                self.dispatch(inbound, packet, now);
            }
        }
    }

    fn refresh_binding(&mut self, inbound: &Inbound) {
        let track = !self.use_tcp && !self.is_dynamic();
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        if track {
            sender.add_endpoints(&[inbound.endpoint]);
        }
        if sender.is_stale() {
            tracing::debug!("re-latching to {} on {:?}", inbound.endpoint, inbound.socket);
            sender.relatch(inbound);
        }
    }

    fn dispatch(&mut self, inbound: Inbound, packet: Packet, now: Instant) {
        match packet.kind() {
            PacketKind::Syn => self.on_syn(&inbound, &packet, now),
            PacketKind::SynAck => self.on_syn_ack(&inbound, &packet, now),
            PacketKind::SynAckAck => self.on_syn_ack_ack(&inbound, &packet, now),
            PacketKind::Data | PacketKind::Fin => self.on_stream(packet, now),
            PacketKind::Heartbeat => {
                let resp = self.control(PacketKind::HeartbeatResp);
                self.post(resp, now);
            }
            PacketKind::HeartbeatResp
            | PacketKind::CallReq
            | PacketKind::CalledResp
            | PacketKind::CalledReq
            | PacketKind::CallResp => {}
        }
    }

    fn on_syn(&mut self, inbound: &Inbound, packet: &Packet, now: Instant) {
        match self.state {
            State::Init if self.origin == Origin::Accept => {
                self.remote_session = packet.header.src_session;
                self.sender = Some(Sender::from_inbound(inbound));
                self.transition(State::WaitAckAck, now);
            }
            State::Init => {}
            _ if !self.use_tcp => self.resend(ResponseKey::SynAck, now),
            _ => {}
        }
    }

    fn on_syn_ack(&mut self, inbound: &Inbound, packet: &Packet, now: Instant) {
        if self.state != State::WaitAck {
            if !self.use_tcp {
                self.resend(ResponseKey::SynAckAck, now);
            }
            return;
        }
        self.use_tcp = inbound.endpoint.protocol == Protocol::Tcp;
        self.latch_sender(inbound);
        self.remote_session = packet.header.src_session;
        self.expected = packet.next_seq();

        let mut ack = self.control(PacketKind::SynAckAck);
        ack.header.ack_seq = packet.header.seq;
        if !self.use_tcp {
            self.responses.insert(ResponseKey::SynAckAck, ack.clone());
        }
        self.post(ack, now);
        self.transition(State::Establish, now);
    }

    fn on_syn_ack_ack(&mut self, inbound: &Inbound, packet: &Packet, now: Instant) {
        if self.state != State::WaitAckAck {
            return;
        }
        self.use_tcp = packet.header.use_tcp;
        self.latch_sender(inbound);
        self.expected = packet.next_seq();
        self.transition(State::Establish, now);

        let early = self.early.drain();
        if !early.is_empty() {
            tracing::debug!("{} flushing {} early packet(s)", self.tag(), early.len());
        }
        for packet in early {
            self.feed_transfer(packet, now);
        }
    }

    /// Replace the remote sender with one latched on `inbound`
    fn latch_sender(&mut self, inbound: &Inbound) {
        let dynamic = inbound.socket.punched().is_some();
        let mut sender = Sender::from_inbound(inbound);
        if let Some(mut old) = self.sender.take() {
            if !self.use_tcp && !dynamic {
                sender.add_endpoints(old.endpoints());
            }
            old.abort();
        }
        self.sender = Some(sender);
    }

    fn on_stream(&mut self, packet: Packet, now: Instant) {
        if self.transfer.is_some() {
            self.feed_transfer(packet, now);
        } else if self.state == State::WaitAckAck && !self.use_tcp {
            self.early.insert(packet);
        }
    }

    fn on_called(&mut self, inbound: &Inbound, packet: &Packet, now: Instant) {
        if self.origin != Origin::Accept {
            tracing::debug!("{} ignoring call relayed to the calling side", self.tag());
            return;
        }
        let prev = self.state;
        if self.state == State::Init {
            if self.remote_session.is_none() {
                self.remote_session = packet.header.src_session;
            }
            self.sender = Some(Sender::with_endpoints(
                SocketRef::Primary,
                &packet.body.endpoints,
            ));
            self.transition(State::WaitAckAck, now);
            if !packet.body.dynamics.is_empty() {
                self.add_remote_endpoints(&packet.body.endpoints, &packet.body.dynamics, now);
            }
        } else {
            self.add_remote_endpoints(&packet.body.endpoints, &packet.body.dynamics, now);
        }

        // the relay may have lost our earlier answer, so always answer
        let key = ResponseKey::CalledResp {
            dynamic: packet.body.is_dynamic,
        };
        let resp = match self.responses.get(&key) {
            Some(resp) => resp.clone(),
            None => {
                let resp = self.called_resp(packet.body.is_dynamic);
                self.responses.insert(key, resp.clone());
                resp
            }
        };
        Sender::from_inbound(inbound).post(resp, &mut self.out.transmits);

        if matches!(prev, State::Init | State::WaitAckAck) {
            if let Some(local) =
                self.called
                    .on_called(inbound.endpoint, packet.body.is_dynamic, &mut self.out)
            {
                self.post_dynamic_called(inbound.endpoint, local);
            }
        }
    }

    fn post_dynamic_called(&mut self, from: Endpoint, local: Endpoint) {
        let resp = dynamic_variant(&self.called_resp(false), local);
        self.called.post(from, resp, &mut self.out);
    }

    fn on_call_resp(&mut self, inbound: &Inbound, packet: &Packet, now: Instant) {
        if self.state != State::WaitAck || self.sn_call.is_none() {
            return;
        }
        let call = self.call_packet();
        if let Some(sn) = self.sn_call.as_mut() {
            sn.on_call_resp(inbound, packet, now);
            if let Some(near) = packet.body.near_sn.clone() {
                tracing::debug!("call response points at signaling peer {}", near.peer_id);
                sn.add_peers(vec![near], now, &call, &mut self.out);
            }
        }
        self.add_remote_endpoints(&packet.body.endpoints, &packet.body.dynamics, now);
    }

    // ========================================================================
    // Candidates and probing
    // ========================================================================

    /// Merge candidates and probe the new ones immediately
    fn add_remote_endpoints(&mut self, endpoints: &[Endpoint], dynamics: &[Endpoint], now: Instant) {
        let tag = self.tag();
        if let Some(tc) = self.try_connect.as_mut() {
            tc.add_dynamics(dynamics);
        }
        let all: Vec<Endpoint> = endpoints.iter().chain(dynamics).copied().collect();
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        let added = sender.add_endpoints(&all);
        if added.is_empty() {
            return;
        }
        tracing::debug!("{} {} new candidate(s): {:?}", tag, added.len(), added);

        if let Some(tc) = self.try_connect.as_ref() {
            let handshake = tc.handshake().clone();
            let posted = if added.len() < sender.endpoints().len() {
                sender
                    .narrowed(&added)
                    .post(handshake, &mut self.out.transmits)
            } else {
                sender.post(handshake, &mut self.out.transmits)
            };
            if posted {
                self.last_send = now;
            }
        }
        let remotes = self
            .sn_call
            .iter_mut()
            .flat_map(SnCall::punched_remotes_mut)
            .chain(self.called.punched_remotes_mut());
        for remote in remotes {
            remote.add_endpoints(&added);
        }
    }

    /// One prober attempt
    fn probe(&mut self, now: Instant) {
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;
        if self
            .try_connect
            .as_ref()
            .is_some_and(|tc| tc.is_expired(now, config.connect_timeout))
        {
            let reason = diagnose(&self.evidence());
            tracing::warn!("{} connect timed out: {}", self.tag(), reason);
            self.fail(reason, now);
            return;
        }
        let Some(tc) = self.try_connect.as_mut() else {
            return;
        };

        if config.dynamic_expand > 0
            && tc.is_near_timeout(now, config.connect_timeout, config.try_connect_interval)
        {
            if let Some(sender) = self.sender.as_mut() {
                let guesses = tc.guesses(sender.endpoints(), config.dynamic_expand);
                sender.add_endpoints(&guesses);
            }
        }

        let attempt = tc.next_attempt(now, config.try_connect_interval);
        let handshake = tc.handshake().clone();
        if let Some(sender) = self.sender.as_mut() {
            let posted = if attempt.first {
                sender
                    .udp_only()
                    .post(handshake, &mut self.out.transmits)
            } else if sender.probe_due(now, config.try_connect_interval) {
                sender.set_resend_all(attempt.resend_all);
                sender.post(handshake, &mut self.out.transmits)
            } else {
                false
            };
            if posted {
                self.last_send = now;
            }
        }
        self.probe_punched(now);
    }

    /// Probe through every ready punched socket
    fn probe_punched(&mut self, now: Instant) {
        let interval = self.ctx.config.try_connect_interval;
        let Some(tc) = self.try_connect.as_ref() else {
            return;
        };
        let handshake = tc.handshake();
        let candidates = self.sender.as_ref().map_or(&[][..], Sender::endpoints);
        let remotes = self
            .sn_call
            .iter_mut()
            .flat_map(SnCall::punched_remotes_mut)
            .chain(self.called.punched_remotes_mut());
        for remote in remotes {
            remote.add_endpoints(candidates);
            if remote.probe_due(now, interval)
                && remote.post(handshake.clone(), &mut self.out.transmits)
            {
                self.last_send = now;
            }
        }
    }

    fn evidence(&self) -> Evidence {
        Evidence {
            candidates: self.candidates().len(),
            rendezvous: self.sn_call.is_some(),
            sn_peers: self.sn_call.as_ref().map_or(0, SnCall::peer_count),
            sn_responded: self.sn_call.as_ref().is_some_and(SnCall::any_responded),
        }
    }

    fn heartbeat_tick(&mut self, now: Instant) {
        let last_send = self.last_send;
        let Some(tick) = self
            .heartbeat
            .as_mut()
            .and_then(|hb| hb.handle_timeout(now, last_send))
        else {
            return;
        };
        if tick.broken {
            self.fail(ConnectError::RemoteSilent, now);
            return;
        }
        if tick.mark_stale && !self.use_tcp && !self.is_dynamic() {
            if let Some(sender) = self.sender.as_mut() {
                sender.mark_stale();
            }
        }
        if tick.send {
            let ping = self.control(PacketKind::Heartbeat);
            self.post(ping, now);
        }
    }

    // ========================================================================
    // Packets out
    // ========================================================================

    fn header(&self, kind: PacketKind) -> Header {
        debug_assert!(self.remote.is_some(), "packet built before remote is known");
        Header {
            kind,
            use_tcp: self.use_tcp,
            seq: self.seq.peek(),
            ack_seq: self.expected,
            src: self.local.clone(),
            dest: self
                .remote
                .clone()
                .unwrap_or_else(|| self.local.clone()),
            src_session: Some(self.local_session),
            dest_session: self.remote_session,
        }
    }

    /// Control packet consuming its sequence cost
    fn control(&mut self, kind: PacketKind) -> Packet {
        let mut header = self.header(kind);
        header.seq = self.seq.advance(kind.seq_cost());
        Packet {
            header,
            body: Body::default(),
        }
    }

    fn call_packet(&self) -> Packet {
        let mut packet = Packet {
            header: self.header(PacketKind::CallReq),
            body: Body::default(),
        };
        packet.body.endpoints = self.ctx.endpoints.clone();
        packet
    }

    fn called_resp(&self, dynamic: bool) -> Packet {
        let mut packet = Packet {
            header: self.header(PacketKind::CalledResp),
            body: Body::default(),
        };
        packet.body.endpoints = self.ctx.endpoints.clone();
        packet.body.is_dynamic = dynamic;
        packet
    }

    fn post(&mut self, packet: Packet, now: Instant) {
        if let Some(sender) = self.sender.as_mut() {
            if sender.post(packet, &mut self.out.transmits) {
                self.last_send = now;
            }
        }
    }

    fn resend(&mut self, key: ResponseKey, now: Instant) {
        if let Some(packet) = self.responses.get(&key).cloned() {
            tracing::trace!("{} re-sending cached {:?}", self.tag(), key);
            self.post(packet, now);
        }
    }

    // ========================================================================
    // Transfer plumbing
    // ========================================================================

    fn with_transfer<R>(
        &mut self,
        now: Instant,
        f: impl FnOnce(&mut dyn Transfer, &mut Link<'_>) -> R,
    ) -> Option<R> {
        let template = self.header(PacketKind::Data);
        let transfer = self.transfer.as_mut()?;
        let sender = self.sender.as_mut()?;
        let mut link = Link::new(
            &mut self.seq,
            &template,
            sender,
            &mut self.out.transmits,
            &mut self.transfer_events,
            &mut self.last_send,
            now,
        );
        Some(f(&mut **transfer, &mut link))
    }

    fn feed_transfer(&mut self, packet: Packet, now: Instant) {
        self.with_transfer(now, |t, link| t.on_packet(link, packet));
        self.process_transfer_events(now);
    }

    fn process_transfer_events(&mut self, now: Instant) {
        while let Some(event) = self.transfer_events.pop_front() {
            if self.state.is_terminal() {
                self.transfer_events.clear();
                return;
            }
            match event {
                TransferEvent::Data(bytes) => self.out.emit(Event::Data(bytes)),
                TransferEvent::Drained => self.out.emit(Event::Drained),
                TransferEvent::HalfCloseSent => match self.state {
                    State::LastAck => self.transition(State::Closed, now),
                    State::FinWait1 => self.transition(State::FinWait2, now),
                    State::Closing => self.transition(State::TimeWait, now),
                    _ => {}
                },
                TransferEvent::PeerHalfClosed => {
                    self.out.emit(Event::End);
                    match self.state {
                        State::Establish => {
                            self.transition(State::CloseWait, now);
                            if !self.options.allow_half_open {
                                self.close(false, now);
                            }
                        }
                        State::FinWait1 => self.transition(State::Closing, now),
                        State::FinWait2 => self.transition(State::TimeWait, now),
                        _ => {}
                    }
                }
            }
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn fail(&mut self, reason: ConnectError, now: Instant) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(State::Break, now);
        if !self.error_reported {
            self.error_reported = true;
            self.out.emit(Event::Error(reason));
        }
        self.transition(State::Closed, now);
    }

    fn transition(&mut self, to: State, now: Instant) {
        debug_assert!(
            self.state.can_transition(to),
            "invalid transition {:?} -> {:?}",
            self.state,
            to
        );
        if !self.state.can_transition(to) {
            tracing::warn!("{} refusing transition {:?} -> {:?}", self.tag(), self.state, to);
            return;
        }
        let from = self.state;
        self.state = to;
        tracing::debug!("{} state transition: {:?} -> {:?}", self.tag(), from, to);

        match to {
            State::WaitAck => self.enter_wait_ack(now),
            State::WaitAckAck => self.enter_wait_ack_ack(now),
            State::Establish => self.enter_establish(now),
            State::FinWait1 | State::LastAck => {
                self.with_transfer(now, |t, link| t.send_half_close(link));
            }
            State::TimeWait => {
                self.heartbeat = None;
                self.linger = Some(now + self.ctx.config.linger());
            }
            State::Closed => self.enter_closed(),
            _ => {}
        }
    }

    fn enter_wait_ack(&mut self, now: Instant) {
        let syn = self.control(PacketKind::Syn);
        self.try_connect = Some(TryConnect::new(syn, now));
        if !self.self_connect && self.ctx.config.rendezvous {
            if let Some(remote) = self.remote.as_ref() {
                self.sn_call = Some(SnCall::start(
                    self.local.peer.clone(),
                    remote.peer.clone(),
                    &self.ctx.config,
                    now,
                    &mut self.out,
                ));
            }
        }
        self.probe(now);
    }

    fn enter_wait_ack_ack(&mut self, now: Instant) {
        let syn_ack = self.control(PacketKind::SynAck);
        if !self.use_tcp {
            self.responses.insert(ResponseKey::SynAck, syn_ack.clone());
        }
        self.try_connect = Some(TryConnect::new(syn_ack, now));
        self.probe(now);
    }

    fn enter_establish(&mut self, now: Instant) {
        let keep = self.sender.as_ref().and_then(|s| s.socket().punched());
        if let Some(tc) = self.try_connect.take() {
            tracing::debug!("{} prober finished after {} attempt(s)", self.tag(), tc.tries());
        }
        if let Some(sn) = self.sn_call.take() {
            sn.stop(keep, &mut self.out);
        }
        self.called.stop(keep, &mut self.out);
        self.heartbeat = Some(Heartbeat::new(&self.ctx.config, now));
        self.transfer = Some(self.ctx.transfer.create(TransferParams {
            use_tcp: self.use_tcp,
            expected_remote_seq: self.expected,
        }));
        if self.use_tcp {
            if let Some(sender) = self.sender.as_ref() {
                self.watched = Some(sender.socket());
                self.out.request(Request::WatchSocket(sender.socket()));
            }
        }
        tracing::info!(
            "{} established {} <-> {} via {:?}",
            self.tag(),
            self.local,
            self.remote.as_ref().map_or_else(String::new, ToString::to_string),
            self.remote_endpoint()
        );
        self.out.emit(match self.origin {
            Origin::Connect => Event::Connected,
            Origin::Accept => Event::Accepted,
        });
    }

    fn enter_closed(&mut self) {
        let keep = self.sender.as_ref().and_then(|s| s.socket().punched());
        self.responses.clear();
        self.try_connect = None;
        if let Some(sn) = self.sn_call.take() {
            sn.stop(keep, &mut self.out);
        }
        self.called.stop(keep, &mut self.out);
        self.heartbeat = None;
        self.linger = None;
        if let Some(socket) = self.watched.take() {
            self.out.request(Request::UnwatchSocket(socket));
        }
        if let Some(mut transfer) = self.transfer.take() {
            transfer.close();
        }
        self.transfer_events.clear();
        self.early.clear();
        if let Some(mut sender) = self.sender.take() {
            sender.abort();
            if let Some(id) = keep {
                self.out.request(Request::ReleaseSocket(id));
            }
        }
        tracing::info!("{} closed", self.tag());
        self.out.emit(Event::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::endpoint::PeerId;
    use std::time::Duration;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn ctx(peer: &str, endpoint: &str, rendezvous: bool) -> Arc<Context> {
        let config = StackConfig {
            rendezvous,
            ..StackConfig::default()
        };
        Arc::new(Context::new(peer.into(), vec![ep(endpoint)], config))
    }

    fn inbound(endpoint: &str) -> Inbound {
        Inbound {
            socket: SocketRef::Primary,
            endpoint: ep(endpoint),
        }
    }

    fn transmits(conn: &mut Connection) -> Vec<Transmit> {
        std::iter::from_fn(|| conn.poll_transmit()).collect()
    }

    fn events(conn: &mut Connection) -> Vec<Event> {
        std::iter::from_fn(|| conn.poll_event()).collect()
    }

    fn requests(conn: &mut Connection) -> Vec<Request> {
        std::iter::from_fn(|| conn.poll_request()).collect()
    }

    const A_EP: &str = "udp:198.51.100.1:4000";
    const B_EP: &str = "udp:198.51.100.2:4000";

    /// Drive a caller and a callee through the direct handshake
    fn established_pair(now: Instant) -> (Connection, Connection) {
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, false),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        let target = ConnectTarget::new(PortAddr::new("bob", 80)).with_endpoints(vec![ep(B_EP)]);
        a.connect(target, now).unwrap();
        let syn = transmits(&mut a).pop().unwrap().packet;
        assert_eq!(syn.kind(), PacketKind::Syn);

        let mut b = Connection::incoming(
            ctx("bob", B_EP, false),
            80,
            SessionId(2),
            syn.header.src.clone(),
            syn.header.src_session,
            ConnectionOptions::default(),
            now,
        );
        b.handle_packet(inbound(A_EP), syn, now);
        assert_eq!(b.state(), State::WaitAckAck);
        let syn_ack = transmits(&mut b).pop().unwrap().packet;
        assert_eq!(syn_ack.kind(), PacketKind::SynAck);

        a.handle_packet(inbound(B_EP), syn_ack, now);
        assert_eq!(a.state(), State::Establish);
        let ack = transmits(&mut a).pop().unwrap().packet;
        assert_eq!(ack.kind(), PacketKind::SynAckAck);

        b.handle_packet(inbound(A_EP), ack, now);
        assert_eq!(b.state(), State::Establish);
        assert_eq!(events(&mut a), vec![Event::Connected]);
        assert_eq!(events(&mut b), vec![Event::Accepted]);
        (a, b)
    }

    /// Deliver everything `from` queued to `to`
    fn pump(from: &mut Connection, from_ep: &str, to: &mut Connection, now: Instant) {
        for t in transmits(from) {
            to.handle_packet(inbound(from_ep), t.packet, now);
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(State::Init.can_transition(State::WaitAck));
        assert!(State::Init.can_transition(State::Closed));
        assert!(!State::Init.can_transition(State::Establish));
        assert!(!State::Init.can_transition(State::Break));
        assert!(State::WaitAck.can_transition(State::Break));
        assert!(State::Break.can_transition(State::Closed));
        assert!(!State::Break.can_transition(State::Establish));
        assert!(!State::Closed.can_transition(State::Closed));
        assert!(State::FinWait1.can_transition(State::Closing));
        assert!(!State::Establish.can_transition(State::TimeWait));
    }

    #[test]
    fn test_direct_handshake_without_rendezvous() {
        init_tracing();
        let now = Instant::now();
        let (a, b) = established_pair(now);
        assert!(!a.is_rendezvous_active());
        assert!(!a.is_probing());
        assert!(!b.is_probing());
        assert_eq!(a.remote_session(), Some(SessionId(2)));
        assert_eq!(b.remote_session(), Some(SessionId(1)));
        assert_eq!(a.remote_endpoint(), Some(ep(B_EP)));
    }

    #[test]
    fn test_connect_twice_rejected() {
        let now = Instant::now();
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, false),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        a.connect(ConnectTarget::new(PortAddr::new("bob", 80)), now).unwrap();
        assert!(matches!(
            a.connect(ConnectTarget::new(PortAddr::new("bob", 80)), now),
            Err(Error::AlreadyConnected)
        ));
        assert!(matches!(a.send(b"x", now), Err(Error::InvalidState(State::WaitAck))));
    }

    #[test]
    fn test_data_flows_both_ways() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        assert_eq!(a.send(b"ping", now).unwrap(), 4);
        pump(&mut a, A_EP, &mut b, now);
        assert_eq!(
            events(&mut b),
            vec![Event::Data(b"ping".to_vec())]
        );
        assert_eq!(events(&mut a), vec![Event::Drained]);

        b.send(b"pong", now).unwrap();
        pump(&mut b, B_EP, &mut a, now);
        assert_eq!(events(&mut a), vec![Event::Data(b"pong".to_vec())]);
    }

    #[test]
    fn test_repeated_syn_ack_resends_cached_ack() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        let mut dup = Packet::new(
            PacketKind::SynAck,
            PortAddr::new("bob", 80),
            a.local().clone(),
        );
        dup.header.dest_session = Some(SessionId(1));
        a.handle_packet(inbound(B_EP), dup, now);
        let sent = transmits(&mut a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet.kind(), PacketKind::SynAckAck);
        assert_eq!(a.state(), State::Establish);
    }

    #[test]
    fn test_early_data_flushed_once_in_order() {
        let now = Instant::now();
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, false),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        a.connect(
            ConnectTarget::new(PortAddr::new("bob", 80)).with_endpoints(vec![ep(B_EP)]),
            now,
        )
        .unwrap();
        let syn = transmits(&mut a).pop().unwrap().packet;
        let mut b = Connection::incoming(
            ctx("bob", B_EP, false),
            80,
            SessionId(2),
            syn.header.src.clone(),
            syn.header.src_session,
            ConnectionOptions::default(),
            now,
        );
        b.handle_packet(inbound(A_EP), syn, now);
        let syn_ack = transmits(&mut b).pop().unwrap().packet;
        a.handle_packet(inbound(B_EP), syn_ack, now);
        let ack = transmits(&mut a).pop().unwrap().packet;
        events(&mut a);

        // a sends before b has seen the final ack
        a.send(b"first", now).unwrap();
        a.send(b"second", now).unwrap();
        let data: Vec<Packet> = transmits(&mut a).into_iter().map(|t| t.packet).collect();
        b.handle_packet(inbound(A_EP), data[1].clone(), now);
        b.handle_packet(inbound(A_EP), data[0].clone(), now);
        b.handle_packet(inbound(A_EP), data[1].clone(), now);
        assert_eq!(b.early_len(), 2);

        b.handle_packet(inbound(A_EP), ack, now);
        assert_eq!(b.early_len(), 0);
        assert_eq!(
            events(&mut b),
            vec![
                Event::Accepted,
                Event::Data(b"first".to_vec()),
                Event::Data(b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn test_force_close_sends_nothing_and_is_idempotent() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        a.close(true, now);
        assert_eq!(a.state(), State::Closed);
        assert!(transmits(&mut a).is_empty());
        assert_eq!(events(&mut a), vec![Event::Closed]);
        requests(&mut a);

        a.close(true, now);
        a.close(false, now);
        assert!(events(&mut a).is_empty());
        assert!(requests(&mut a).is_empty());
        assert!(a.poll_timeout().is_none());
    }

    #[test]
    fn test_orderly_close_with_auto_close() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        a.close(false, now);
        assert_eq!(a.state(), State::FinWait1);

        // fin reaches b, which closes its side too
        pump(&mut a, A_EP, &mut b, now);
        assert_eq!(b.state(), State::LastAck);
        assert_eq!(events(&mut b), vec![Event::End]);

        // b's ack and fin reach a
        pump(&mut b, B_EP, &mut a, now);
        assert_eq!(a.state(), State::TimeWait);
        assert_eq!(events(&mut a), vec![Event::End]);

        // a's ack of b's fin
        pump(&mut a, A_EP, &mut b, now);
        assert_eq!(b.state(), State::Closed);
        assert_eq!(events(&mut b), vec![Event::Closed]);

        let linger = a.poll_timeout().unwrap();
        assert_eq!(linger, now + Duration::from_secs(10));
        a.handle_timeout(linger);
        assert_eq!(a.state(), State::Closed);
        assert_eq!(events(&mut a), vec![Event::Closed]);
    }

    #[test]
    fn test_half_open_allowed_keeps_sending() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        b.options.allow_half_open = true;
        a.close(false, now);
        pump(&mut a, A_EP, &mut b, now);
        assert_eq!(b.state(), State::CloseWait);
        assert_eq!(b.send(b"still here", now).unwrap(), 10);
    }

    #[test]
    fn test_heartbeat_breakdown_reports_error_once() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        let mut t = now;
        let deadline = now + Duration::from_secs(120);
        while a.state() != State::Closed && t < deadline {
            t = a.poll_timeout().unwrap();
            a.handle_timeout(t);
        }
        assert_eq!(a.state(), State::Closed);
        assert!(t > now + Duration::from_secs(60));
        let evs = events(&mut a);
        assert_eq!(
            evs,
            vec![Event::Error(ConnectError::RemoteSilent), Event::Closed]
        );
        let pings = transmits(&mut a)
            .iter()
            .filter(|t| t.packet.kind() == PacketKind::Heartbeat)
            .count();
        assert!(pings > 0);
    }

    #[test]
    fn test_heartbeat_answered() {
        let now = Instant::now();
        let (mut a, mut b) = established_pair(now);
        let ping = a.control(PacketKind::Heartbeat);
        b.handle_packet(inbound(A_EP), ping, now);
        let sent = transmits(&mut b);
        assert_eq!(sent[0].packet.kind(), PacketKind::HeartbeatResp);
    }

    #[test]
    fn test_timeout_without_rendezvous_and_candidates() {
        let now = Instant::now();
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, false),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        a.connect(ConnectTarget::new(PortAddr::new("bob", 80)), now).unwrap();
        a.handle_timeout(now + Duration::from_secs(20));
        assert_eq!(
            events(&mut a),
            vec![Event::Error(ConnectError::Timeout), Event::Closed]
        );
    }

    #[test]
    fn test_timeout_with_silent_candidates() {
        let now = Instant::now();
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, false),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        a.connect(
            ConnectTarget::new(PortAddr::new("bob", 80)).with_endpoints(vec![ep(B_EP)]),
            now,
        )
        .unwrap();
        a.handle_timeout(now + Duration::from_secs(20));
        assert_eq!(
            events(&mut a),
            vec![Event::Error(ConnectError::RemoteUnresponsive), Event::Closed]
        );
    }

    #[test]
    fn test_timeout_with_no_signaling_peers() {
        let now = Instant::now();
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, true),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        a.connect(ConnectTarget::new(PortAddr::new("bob", 80)), now).unwrap();
        assert!(a.is_rendezvous_active());
        a.handle_timeout(now + Duration::from_secs(20));
        assert_eq!(
            events(&mut a),
            vec![Event::Error(ConnectError::NoRoute), Event::Closed]
        );
        assert!(!a.is_rendezvous_active());
    }

    #[test]
    fn test_called_always_answered_and_escalates() {
        let now = Instant::now();
        let relay = inbound("udp:192.0.2.50:7000");
        let mut b = Connection::incoming(
            ctx("bob", B_EP, true),
            80,
            SessionId(2),
            PortAddr::new("alice", 40000),
            Some(SessionId(1)),
            ConnectionOptions::default(),
            now,
        );
        let mut called = Packet::new(
            PacketKind::CalledReq,
            PortAddr::new("alice", 40000),
            PortAddr::new("bob", 80),
        );
        called.header.src_session = Some(SessionId(1));
        called.body.endpoints = vec![ep(A_EP)];

        b.handle_packet(relay, called.clone(), now);
        assert_eq!(b.state(), State::WaitAckAck);
        let sent = transmits(&mut b);
        assert!(sent.iter().any(|t| t.packet.kind() == PacketKind::SynAck
            && t.destinations == vec![ep(A_EP)]));
        let first_resp: Vec<_> = sent
            .iter()
            .filter(|t| t.packet.kind() == PacketKind::CalledResp)
            .collect();
        assert_eq!(first_resp.len(), 1);
        assert_eq!(first_resp[0].destinations, vec![relay.endpoint]);

        b.handle_packet(relay, called, now);
        let sent = transmits(&mut b);
        let second_resp: Vec<_> = sent
            .iter()
            .filter(|t| t.packet.kind() == PacketKind::CalledResp)
            .collect();
        assert_eq!(second_resp.len(), 1);
        assert_eq!(second_resp[0].packet, first_resp[0].packet);
        assert!(requests(&mut b).contains(&Request::OpenPunchedSocket(PunchTicket::Called(
            relay.endpoint
        ))));

        let local = ep("udp:198.51.100.2:50123");
        b.handle_punched_socket(
            PunchTicket::Called(relay.endpoint),
            Some((SocketId(5), local)),
            now,
        );
        let sent = transmits(&mut b);
        let dynamic = sent
            .iter()
            .find(|t| t.packet.kind() == PacketKind::CalledResp)
            .unwrap();
        assert_eq!(dynamic.socket, SocketRef::Punched(SocketId(5)));
        assert!(dynamic.packet.body.is_dynamic);
        assert_eq!(dynamic.packet.body.dynamics, vec![local]);

        b.close(false, now);
        assert!(requests(&mut b).contains(&Request::ReleaseSocket(SocketId(5))));
    }

    #[test]
    fn test_stale_binding_relatched_by_next_packet() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);
        a.sender.as_mut().unwrap().mark_stale();
        let moved = "udp:198.51.100.2:4555";
        let mut resp = Packet::new(
            PacketKind::HeartbeatResp,
            PortAddr::new("bob", 80),
            a.local().clone(),
        );
        resp.header.dest_session = Some(SessionId(1));
        a.handle_packet(inbound(moved), resp, now);
        assert_eq!(a.remote_endpoint(), Some(ep(moved)));
        assert!(a.candidates().contains(&ep(B_EP)));
    }

    fn bound(now: Instant) -> Connection {
        Connection::outgoing(
            ctx("alice", A_EP, false),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        )
    }

    /// Packet from a stranger naming the bound connection's session
    fn aimed_at(conn: &Connection, kind: PacketKind) -> Packet {
        let mut packet = Packet::new(kind, PortAddr::new("mallory", 9), conn.local().clone());
        packet.header.src_session = Some(SessionId(77));
        packet.header.dest_session = Some(conn.local_session());
        packet.body.endpoints = vec![ep("udp:203.0.113.9:9999")];
        packet
    }

    fn assert_untouched_and_connectable(mut conn: Connection, now: Instant) {
        assert_eq!(conn.state(), State::Init);
        assert_eq!(conn.remote_session(), None);
        assert!(conn.remote().is_none());
        assert!(conn.candidates().is_empty());
        assert!(transmits(&mut conn).is_empty());
        assert!(events(&mut conn).is_empty());

        let target = ConnectTarget::new(PortAddr::new("bob", 80)).with_endpoints(vec![ep(B_EP)]);
        conn.connect(target, now).unwrap();
        assert_eq!(conn.state(), State::WaitAck);
        let syn = transmits(&mut conn).pop().unwrap();
        assert_eq!(syn.packet.kind(), PacketKind::Syn);
        assert_eq!(syn.destinations, vec![ep(B_EP)]);
    }

    #[test]
    fn test_syn_for_unconnected_bound_connection_dropped() {
        init_tracing();
        let now = Instant::now();
        let mut conn = bound(now);
        let syn = aimed_at(&conn, PacketKind::Syn);
        conn.handle_packet(inbound("udp:203.0.113.9:9999"), syn, now);
        assert_eq!(conn.origin(), Origin::Connect);
        assert_untouched_and_connectable(conn, now);
    }

    #[test]
    fn test_called_req_for_unconnected_bound_connection_dropped() {
        init_tracing();
        let now = Instant::now();
        let mut conn = bound(now);
        let called = aimed_at(&conn, PacketKind::CalledReq);
        conn.handle_packet(inbound("udp:192.0.2.50:7000"), called.clone(), now);
        conn.handle_packet(inbound("udp:192.0.2.50:7000"), called, now);
        assert!(requests(&mut conn).is_empty());
        assert_untouched_and_connectable(conn, now);
    }

    #[test]
    fn test_heartbeat_for_unconnected_bound_connection_dropped() {
        let now = Instant::now();
        let mut conn = bound(now);
        let ping = aimed_at(&conn, PacketKind::Heartbeat);
        conn.handle_packet(inbound("udp:203.0.113.9:9999"), ping, now);
        assert_untouched_and_connectable(conn, now);
    }

    #[test]
    fn test_called_req_ignored_by_caller() {
        let now = Instant::now();
        let mut conn = bound(now);
        let target = ConnectTarget::new(PortAddr::new("bob", 80)).with_endpoints(vec![ep(B_EP)]);
        conn.connect(target, now).unwrap();
        transmits(&mut conn);

        let called = aimed_at(&conn, PacketKind::CalledReq);
        conn.handle_packet(inbound("udp:192.0.2.50:7000"), called, now);
        assert_eq!(conn.state(), State::WaitAck);
        assert!(transmits(&mut conn).is_empty());
        assert_eq!(conn.candidates().to_vec(), vec![ep(B_EP)]);
    }

    #[test]
    fn test_primary_socket_closure_breaks_connection() {
        let now = Instant::now();
        let (mut a, _b) = established_pair(now);

        // a punched socket the connection does not use changes nothing
        a.handle_socket_closed(SocketRef::Punched(SocketId(9)), now);
        assert_eq!(a.state(), State::Establish);
        assert!(events(&mut a).is_empty());

        a.handle_socket_closed(SocketRef::Primary, now);
        assert_eq!(a.state(), State::Closed);
        assert_eq!(
            events(&mut a),
            vec![Event::Error(ConnectError::TransportClosed), Event::Closed]
        );
        assert!(transmits(&mut a).is_empty());

        a.handle_socket_closed(SocketRef::Primary, now);
        assert!(events(&mut a).is_empty());
    }

    #[test]
    fn test_call_resp_hint_adds_nearest_signaling_peer() {
        init_tracing();
        let now = Instant::now();
        let mut a = Connection::outgoing(
            ctx("alice", A_EP, true),
            40000,
            SessionId(1),
            ConnectionOptions::default(),
            now,
        );
        a.connect(ConnectTarget::new(PortAddr::new("bob", 80)), now)
            .unwrap();
        let lookup = requests(&mut a)
            .into_iter()
            .find_map(|r| match r {
                Request::FindSn { lookup, .. } => Some(lookup),
                _ => None,
            })
            .unwrap();

        let far = ep("udp:192.0.2.1:7000");
        let near = ep("udp:192.0.2.2:7000");
        a.handle_sn_found(lookup, vec![PeerInfo::new("s1", vec![far])], now);
        let calls: Vec<_> = transmits(&mut a)
            .into_iter()
            .filter(|t| t.packet.kind() == PacketKind::CallReq)
            .flat_map(|t| t.destinations)
            .collect();
        assert_eq!(calls, vec![far]);

        let mut resp = Packet::new(PacketKind::CallResp, PortAddr::new("s1", 0), a.local().clone());
        resp.header.dest_session = Some(a.local_session());
        resp.body.responder = Some(PeerId::new("s1"));
        resp.body.near_sn = Some(PeerInfo::new("s2", vec![near]));
        a.handle_packet(inbound("udp:192.0.2.1:7000"), resp, now);

        assert_eq!(a.state(), State::WaitAck);
        let calls: Vec<_> = transmits(&mut a)
            .into_iter()
            .filter(|t| t.packet.kind() == PacketKind::CallReq)
            .flat_map(|t| t.destinations)
            .collect();
        assert_eq!(calls, vec![near]);
    }
}
