//! Process-wide protocol stack.
//!
//! The [`Stack`] owns every connection of one local peer, the vport and
//! session tables used to route inbound packets, the listeners and the
//! remote filter. Like [`Connection`] it performs no I/O: the driver feeds
//! datagrams and timer expiries in and drains transmits, events and
//! requests out, each tagged with the connection they belong to.

use crate::config::{ConnectionOptions, StackConfig};
use crate::connection::{ConnectTarget, Connection, Origin, State};
use crate::endpoint::{Endpoint, PeerId, PeerInfo, PortAddr, SessionId, VPort};
use crate::error::Error;
use crate::filter::RemoteFilter;
use crate::output::{Event, LookupId, PunchTicket, Request};
use crate::packet::{Packet, PacketKind};
use crate::sender::{Inbound, SocketId, SocketRef, Transmit};
use crate::transfer::{DatagramTransferFactory, TransferFactory};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Session allocation gives up after this many collisions in a row
const SESSION_ALLOC_ATTEMPTS: usize = 64;

/// Handle of a connection within its stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Settings shared by every connection of a stack
#[derive(Debug)]
pub struct Context {
    /// Local peer id
    pub peer_id: PeerId,
    /// Endpoints the local peer is reachable at
    pub endpoints: Vec<Endpoint>,
    /// Timers and switches
    pub config: StackConfig,
    /// Creates the data-transfer layer of established connections
    pub transfer: Arc<dyn TransferFactory>,
}

impl Context {
    /// Context using the built-in datagram transfer
    #[must_use]
    pub fn new(peer_id: PeerId, endpoints: Vec<Endpoint>, config: StackConfig) -> Self {
        Self {
            peer_id,
            endpoints,
            config,
            transfer: Arc::new(DatagramTransferFactory::default()),
        }
    }

    /// Replace the transfer layer
    #[must_use]
    pub fn with_transfer(mut self, transfer: Arc<dyn TransferFactory>) -> Self {
        self.transfer = transfer;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortOwner {
    Connection(ConnectionId),
    Listener,
}

/// Identity of a remote connection attempt at a listener
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RemoteKey {
    peer: PeerId,
    vport: VPort,
    session: SessionId,
}

#[derive(Debug)]
struct Acceptor {
    options: ConnectionOptions,
    remotes: HashMap<RemoteKey, ConnectionId>,
}

#[derive(Debug)]
struct Slot {
    conn: Connection,
    accepted: Option<RemoteKey>,
}

/// All connections of one local peer
#[derive(Debug)]
pub struct Stack {
    ctx: Arc<Context>,
    filter: RemoteFilter,
    connections: BTreeMap<ConnectionId, Slot>,
    vports: HashMap<VPort, PortOwner>,
    sessions: HashMap<SessionId, ConnectionId>,
    acceptors: HashMap<VPort, Acceptor>,
    next_id: u64,
    next_session: u32,
    next_vport: VPort,
    transmits: VecDeque<Transmit>,
    events: VecDeque<(ConnectionId, Event)>,
    requests: VecDeque<(ConnectionId, Request)>,
}

impl Stack {
    /// Create a stack
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration is inconsistent.
    pub fn new(ctx: Context) -> Result<Self, Error> {
        ctx.config.validate()?;
        let next_vport = *ctx.config.ephemeral_vports.start();
        tracing::info!(
            "stack for {} with {} endpoint(s)",
            ctx.peer_id,
            ctx.endpoints.len()
        );
        Ok(Self {
            ctx: Arc::new(ctx),
            filter: RemoteFilter::new(),
            connections: BTreeMap::new(),
            vports: HashMap::new(),
            sessions: HashMap::new(),
            acceptors: HashMap::new(),
            next_id: 0,
            next_session: rand::random(),
            next_vport,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            requests: VecDeque::new(),
        })
    }

    /// Shared context
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.ctx.peer_id
    }

    /// Remote filter
    #[must_use]
    pub fn filter(&self) -> &RemoteFilter {
        &self.filter
    }

    /// Remote filter, for adding or lifting rules
    pub fn filter_mut(&mut self) -> &mut RemoteFilter {
        &mut self.filter
    }

    /// Connection by id
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id).map(|slot| &slot.conn)
    }

    /// Ids of all live connections
    pub fn connection_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.keys().copied()
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether something listens on `vport`
    #[must_use]
    pub fn is_listening(&self, vport: VPort) -> bool {
        self.acceptors.contains_key(&vport)
    }

    // ========================================================================
    // Listeners and binding
    // ========================================================================

    /// Accept connections on `vport`
    ///
    /// # Errors
    ///
    /// Returns `Error::VPortInUse` if the vport is taken.
    pub fn listen(&mut self, vport: VPort, options: ConnectionOptions) -> Result<(), Error> {
        if self.vports.contains_key(&vport) {
            return Err(Error::VPortInUse(vport));
        }
        self.vports.insert(vport, PortOwner::Listener);
        self.acceptors.insert(
            vport,
            Acceptor {
                options,
                remotes: HashMap::new(),
            },
        );
        tracing::info!("listening on vport {}", vport);
        Ok(())
    }

    /// Stop accepting on `vport`; accepted connections carry on
    ///
    /// # Errors
    ///
    /// Returns `Error::NoListener` if nothing listens there.
    pub fn unlisten(&mut self, vport: VPort) -> Result<(), Error> {
        if self.acceptors.remove(&vport).is_none() {
            return Err(Error::NoListener(vport));
        }
        self.vports.remove(&vport);
        tracing::info!("stopped listening on vport {}", vport);
        Ok(())
    }

    /// Create an outgoing connection bound to `vport`, or an ephemeral one
    ///
    /// # Errors
    ///
    /// Returns `Error::VPortInUse`, `Error::NoFreeVPort` or
    /// `Error::NoFreeSession`.
    pub fn bind(
        &mut self,
        vport: Option<VPort>,
        options: ConnectionOptions,
        now: Instant,
    ) -> Result<ConnectionId, Error> {
        let vport = match vport {
            Some(vport) if self.vports.contains_key(&vport) => {
                return Err(Error::VPortInUse(vport));
            }
            Some(vport) => vport,
            None => self.alloc_vport()?,
        };
        let session = self.alloc_session()?;
        let id = self.alloc_id();
        let conn = Connection::outgoing(Arc::clone(&self.ctx), vport, session, options, now);
        self.vports.insert(vport, PortOwner::Connection(id));
        self.sessions.insert(session, id);
        self.connections.insert(
            id,
            Slot {
                conn,
                accepted: None,
            },
        );
        tracing::debug!("{} bound to vport {} session {}", id, vport, session);
        Ok(id)
    }

    /// Start connecting a bound connection
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` or the connection's own refusal.
    pub fn connect(
        &mut self,
        id: ConnectionId,
        target: ConnectTarget,
        now: Instant,
    ) -> Result<(), Error> {
        let slot = self
            .connections
            .get_mut(&id)
            .ok_or(Error::UnknownConnection(id))?;
        let result = slot.conn.connect(target, now);
        self.collect(id);
        result
    }

    /// Bind an ephemeral vport and connect in one step
    ///
    /// # Errors
    ///
    /// Same as [`Stack::bind`] and [`Stack::connect`].
    pub fn open(
        &mut self,
        target: ConnectTarget,
        options: ConnectionOptions,
        now: Instant,
    ) -> Result<ConnectionId, Error> {
        let id = self.bind(None, options, now)?;
        if let Err(e) = self.connect(id, target, now) {
            self.close(id, true, now)?;
            return Err(e);
        }
        Ok(id)
    }

    /// Send application bytes on a connection
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` or `Error::InvalidState`.
    pub fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<usize, Error> {
        let slot = self
            .connections
            .get_mut(&id)
            .ok_or(Error::UnknownConnection(id))?;
        let result = slot.conn.send(data, now);
        self.collect(id);
        result
    }

    /// Close a connection; closing an already reaped one succeeds
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownConnection` for ids this stack never issued.
    pub fn close(&mut self, id: ConnectionId, force: bool, now: Instant) -> Result<(), Error> {
        match self.connections.get_mut(&id) {
            Some(slot) => {
                slot.conn.close(force, now);
                self.collect(id);
                Ok(())
            }
            None if id.0 < self.next_id => Ok(()),
            None => Err(Error::UnknownConnection(id)),
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Decode and route a datagram
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the bytes are not a packet.
    pub fn handle_datagram(
        &mut self,
        inbound: Inbound,
        bytes: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        let packet = Packet::from_bytes(bytes)?;
        self.handle_packet(inbound, packet, now);
        Ok(())
    }

    /// Route a decoded packet to its connection
    ///
    /// Packets from filtered remotes, for other peers, or matching neither a
    /// session nor a listener are dropped.
    pub fn handle_packet(&mut self, inbound: Inbound, packet: Packet, now: Instant) {
        let header = &packet.header;
        if self
            .filter
            .is_forbidden(inbound.endpoint.addr.ip(), &header.src.peer, now)
        {
            tracing::trace!("dropping {:?} from filtered {}", header.kind, inbound.endpoint);
            return;
        }
        if header.dest.peer != self.ctx.peer_id {
            tracing::trace!("dropping {:?} addressed to {}", header.kind, header.dest.peer);
            return;
        }

        let id = if let Some(session) = header.dest_session {
            let Some(id) = self.sessions.get(&session).copied() else {
                tracing::trace!("dropping {:?} for unknown session {}", header.kind, session);
                return;
            };
            id
        } else if matches!(header.kind, PacketKind::Syn | PacketKind::CalledReq) {
            let Some(id) = self.accept(&packet, now) else {
                return;
            };
            id
        } else {
            tracing::trace!("dropping sessionless {:?}", header.kind);
            return;
        };

        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        if slot.conn.local().vport != packet.header.dest.vport {
            tracing::trace!(
                "dropping {:?} for vport {} routed to {}",
                packet.header.kind,
                packet.header.dest.vport,
                id
            );
            return;
        }
        slot.conn.handle_packet(inbound, packet, now);
        self.collect(id);
    }

    /// Find or create the accepted connection for a handshake opener
    fn accept(&mut self, packet: &Packet, now: Instant) -> Option<ConnectionId> {
        let header = &packet.header;
        let session = header.src_session?;
        let key = RemoteKey {
            peer: header.src.peer.clone(),
            vport: header.src.vport,
            session,
        };
        let acceptor = self.acceptors.get(&header.dest.vport);
        let Some(acceptor) = acceptor else {
            tracing::trace!("no listener on vport {}", header.dest.vport);
            return None;
        };
        if let Some(id) = acceptor.remotes.get(&key) {
            return Some(*id);
        }
        let options = acceptor.options;

        let local_session = match self.alloc_session() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("refusing {}: {}", header.src, e);
                return None;
            }
        };
        let id = self.alloc_id();
        let conn = Connection::incoming(
            Arc::clone(&self.ctx),
            header.dest.vport,
            local_session,
            header.src.clone(),
            Some(session),
            options,
            now,
        );
        tracing::info!("{} accepting {} on vport {}", id, header.src, header.dest.vport);
        self.sessions.insert(local_session, id);
        if let Some(acceptor) = self.acceptors.get_mut(&header.dest.vport) {
            acceptor.remotes.insert(key.clone(), id);
        }
        self.connections.insert(
            id,
            Slot {
                conn,
                accepted: Some(key),
            },
        );
        Some(id)
    }

    // ========================================================================
    // Timers and environment results
    // ========================================================================

    /// Earliest deadline across all connections
    #[must_use]
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections
            .values()
            .filter_map(|slot| slot.conn.poll_timeout())
            .min()
    }

    /// Run every due timer
    pub fn handle_timeout(&mut self, now: Instant) {
        self.filter.purge(now);
        let due: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, slot)| slot.conn.poll_timeout().is_some_and(|t| t <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(slot) = self.connections.get_mut(&id) {
                slot.conn.handle_timeout(now);
            }
            self.collect(id);
        }
    }

    /// Deliver a `FindSn` result
    pub fn handle_sn_found(
        &mut self,
        id: ConnectionId,
        lookup: LookupId,
        peers: Vec<PeerInfo>,
        now: Instant,
    ) {
        if let Some(slot) = self.connections.get_mut(&id) {
            slot.conn.handle_sn_found(lookup, peers, now);
            self.collect(id);
        }
    }

    /// Deliver a `FindPeer` result
    pub fn handle_peer_found(
        &mut self,
        id: ConnectionId,
        lookup: LookupId,
        info: Option<PeerInfo>,
        now: Instant,
    ) {
        if let Some(slot) = self.connections.get_mut(&id) {
            slot.conn.handle_peer_found(lookup, info, now);
            self.collect(id);
        }
    }

    /// Deliver an `OpenPunchedSocket` result
    ///
    /// A socket opened for a connection that is already gone is released.
    pub fn handle_punched_socket(
        &mut self,
        id: ConnectionId,
        ticket: PunchTicket,
        socket: Option<(SocketId, Endpoint)>,
        now: Instant,
    ) {
        match self.connections.get_mut(&id) {
            Some(slot) => {
                slot.conn.handle_punched_socket(ticket, socket, now);
                self.collect(id);
            }
            None => {
                if let Some((socket, _)) = socket {
                    self.requests.push_back((id, Request::ReleaseSocket(socket)));
                }
            }
        }
    }

    /// A socket closed underneath
    pub fn handle_socket_closed(&mut self, socket: SocketRef, now: Instant) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.connections.get_mut(&id) {
                slot.conn.handle_socket_closed(socket, now);
            }
            self.collect(id);
        }
    }

    /// A watched stream socket drained
    pub fn handle_socket_drained(&mut self, socket: SocketRef, now: Instant) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.connections.get_mut(&id) {
                slot.conn.handle_socket_drained(socket, now);
            }
            self.collect(id);
        }
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    /// Next packet to send
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next application event
    pub fn poll_event(&mut self) -> Option<(ConnectionId, Event)> {
        self.events.pop_front()
    }

    /// Next environment request
    pub fn poll_request(&mut self) -> Option<(ConnectionId, Request)> {
        self.requests.pop_front()
    }

    /// Move a connection's outputs to the stack queues, reaping it once closed
    fn collect(&mut self, id: ConnectionId) {
        let Some(slot) = self.connections.get_mut(&id) else {
            return;
        };
        while let Some(transmit) = slot.conn.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        while let Some(event) = slot.conn.poll_event() {
            self.events.push_back((id, event));
        }
        while let Some(request) = slot.conn.poll_request() {
            self.requests.push_back((id, request));
        }
        if slot.conn.state() == State::Closed {
            self.reap(id);
        }
    }

    fn reap(&mut self, id: ConnectionId) {
        let Some(slot) = self.connections.remove(&id) else {
            return;
        };
        let conn = slot.conn;
        self.sessions.remove(&conn.local_session());
        let vport = conn.local().vport;
        match (conn.origin(), slot.accepted) {
            (Origin::Connect, _) => {
                if self.vports.get(&vport) == Some(&PortOwner::Connection(id)) {
                    self.vports.remove(&vport);
                }
            }
            (Origin::Accept, Some(key)) => {
                if let Some(acceptor) = self.acceptors.get_mut(&vport) {
                    acceptor.remotes.remove(&key);
                }
            }
            (Origin::Accept, None) => {}
        }
        tracing::debug!("{} reaped", id);
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn alloc_session(&mut self) -> Result<SessionId, Error> {
        for _ in 0..SESSION_ALLOC_ATTEMPTS {
            let candidate = SessionId(self.next_session);
            self.next_session = self.next_session.wrapping_add(1);
            if !self.sessions.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::NoFreeSession)
    }

    fn alloc_vport(&mut self) -> Result<VPort, Error> {
        let range = self.ctx.config.ephemeral_vports.clone();
        let span = usize::from(*range.end() - *range.start()) + 1;
        for _ in 0..span {
            let candidate = self.next_vport;
            self.next_vport = if candidate >= *range.end() {
                *range.start()
            } else {
                candidate + 1
            };
            if !self.vports.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::NoFreeVPort)
    }

    /// Address of a local vport
    #[must_use]
    pub fn local_addr(&self, vport: VPort) -> PortAddr {
        PortAddr::new(self.ctx.peer_id.clone(), vport)
    }
}
