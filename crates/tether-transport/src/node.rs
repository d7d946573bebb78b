//! Node: the async face of a protocol stack.
//!
//! A [`Node`] spawns one event-loop task that owns the [`Stack`], the
//! primary socket and every punched socket. Application calls travel to it
//! as commands over a channel; socket receive tasks and resolver lookups
//! feed it through channels of their own. After every input the loop
//! drains the stack: transmits go to the sockets, requests are executed,
//! events go to the connection handles.

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::udp::{DatagramSocket, SocketStats};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::packet::MAX_PACKET_SIZE;
use tether_core::{
    ConnectTarget, ConnectionId, ConnectionOptions, Context, Endpoint, Event, Inbound, LookupId,
    PeerId, PeerInfo, PortAddr, PunchTicket, Request, SocketId, SocketRef, Stack, Transmit, VPort,
};
use tether_discovery::PeerFinder;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Inbound datagrams buffered between receive tasks and the loop
const INBOUND_QUEUE: usize = 1024;

/// First pause after a failed receive; doubles per consecutive failure
const RECV_RETRY_BASE: Duration = Duration::from_millis(5);
const RECV_RETRY_MAX: Duration = Duration::from_millis(500);
const RECV_RETRY_MAX_SHIFT: u32 = 7;

type Reply<T> = oneshot::Sender<Result<T, NodeError>>;

enum Command {
    Connect {
        target: ConnectTarget,
        options: ConnectionOptions,
        reply: Reply<(ConnectionId, mpsc::UnboundedReceiver<Event>)>,
    },
    Listen {
        vport: VPort,
        options: ConnectionOptions,
        reply: Reply<mpsc::UnboundedReceiver<ConnectionHandle>>,
    },
    Unlisten {
        vport: VPort,
    },
    Send {
        id: ConnectionId,
        data: Vec<u8>,
        reply: Reply<usize>,
    },
    Close {
        id: ConnectionId,
        force: bool,
        reply: Option<Reply<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Datagram {
    socket: SocketRef,
    from: SocketAddr,
    bytes: Vec<u8>,
}

enum Lookup {
    Sn {
        id: ConnectionId,
        lookup: LookupId,
        peers: Vec<PeerInfo>,
    },
    Peer {
        id: ConnectionId,
        lookup: LookupId,
        info: Option<PeerInfo>,
    },
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// A local peer bound to a UDP socket
#[derive(Debug)]
pub struct Node {
    peer_id: PeerId,
    local_addr: SocketAddr,
    endpoints: Vec<Endpoint>,
    primary: DatagramSocket,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl Node {
    /// Bind the primary socket and start the event loop
    ///
    /// Without a `finder`, rendezvous is disabled and connections rely on
    /// the endpoints given in their target.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig`, `NodeError::BindFailed` or the
    /// stack's refusal of the configuration.
    pub async fn bind(
        config: NodeConfig,
        finder: Option<Arc<dyn PeerFinder>>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let primary = DatagramSocket::bind(config.listen_addr, config.socket_buffer_size)?;
        let local_addr = primary.local_addr()?;
        let endpoints = if config.advertised.is_empty() {
            vec![Endpoint::udp(local_addr)]
        } else {
            config.advertised.clone()
        };

        let mut stack_config = config.stack.clone();
        if finder.is_none() {
            stack_config.rendezvous = false;
        }
        let stack = Stack::new(Context::new(
            config.peer_id.clone(),
            endpoints.clone(),
            stack_config,
        ))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (lookups_tx, lookups_rx) = mpsc::unbounded_channel();
        let primary_task = spawn_receiver(primary.clone(), SocketRef::Primary, inbound_tx.clone());

        let driver = Driver {
            stack,
            config: config.clone(),
            primary: primary.clone(),
            primary_task,
            punched: HashMap::new(),
            next_socket: 0,
            finder,
            commands: commands_tx.downgrade(),
            inbound: inbound_tx,
            lookups: lookups_tx,
            conn_events: HashMap::new(),
            listeners: HashMap::new(),
        };
        let task = tokio::spawn(driver.run(commands_rx, inbound_rx, lookups_rx));

        tracing::info!("node {} bound to {}", config.peer_id, local_addr);
        Ok(Self {
            peer_id: config.peer_id,
            local_addr,
            endpoints,
            primary,
            commands: commands_tx,
            task,
        })
    }

    /// Local peer id
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Bound address of the primary socket
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoints announced to remotes
    #[must_use]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Traffic counters of the primary socket
    #[must_use]
    pub fn stats(&self) -> SocketStats {
        self.primary.stats()
    }

    /// Connect to `target`, resolving once established
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Connect` with the terminal reason when the
    /// attempt fails, or `NodeError::Channel` if the node shut down.
    pub async fn connect(
        &self,
        target: ConnectTarget,
        options: ConnectionOptions,
    ) -> Result<ConnectionHandle, NodeError> {
        let remote = target.addr.clone();
        let (reply, rx) = oneshot::channel();
        self.command(Command::Connect {
            target,
            options,
            reply,
        })?;
        let (id, events) = rx
            .await
            .map_err(|_| NodeError::channel("event loop dropped connect"))??;

        let mut handle = ConnectionHandle {
            id,
            remote,
            commands: self.commands.clone(),
            events,
            closed: false,
        };
        loop {
            match handle.next_event().await {
                Some(Event::Connected) => return Ok(handle),
                Some(Event::Error(e)) => return Err(NodeError::Connect(e)),
                Some(Event::Closed) | None => return Err(NodeError::Closed),
                Some(other) => tracing::trace!("{} event before connect: {:?}", id, other),
            }
        }
    }

    /// Accept connections on `vport`
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Core` if the vport is taken.
    pub async fn listen(
        &self,
        vport: VPort,
        options: ConnectionOptions,
    ) -> Result<Listener, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Listen {
            vport,
            options,
            reply,
        })?;
        let accepted = rx
            .await
            .map_err(|_| NodeError::channel("event loop dropped listen"))??;
        Ok(Listener {
            vport,
            accepted,
            commands: self.commands.clone(),
        })
    }

    /// Break every connection and stop the event loop
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Channel` if the loop already stopped.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Shutdown { reply })?;
        rx.await
            .map_err(|_| NodeError::channel("event loop dropped shutdown"))?;
        self.task
            .await
            .map_err(|e| NodeError::Channel(e.to_string().into()))?;
        tracing::info!("node {} shut down", self.peer_id);
        Ok(())
    }

    fn command(&self, command: Command) -> Result<(), NodeError> {
        self.commands
            .send(command)
            .map_err(|_| NodeError::channel("event loop stopped"))
    }
}

/// Incoming connections on one vport
///
/// Dropping the listener stops accepting; established connections are not
/// affected.
#[derive(Debug)]
pub struct Listener {
    vport: VPort,
    accepted: mpsc::UnboundedReceiver<ConnectionHandle>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Listener {
    /// Listened vport
    #[must_use]
    pub fn vport(&self) -> VPort {
        self.vport
    }

    /// Next established incoming connection; `None` once the node stopped
    pub async fn accept(&mut self) -> Option<ConnectionHandle> {
        self.accepted.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unlisten { vport: self.vport });
    }
}

/// One established connection
///
/// Dropping the handle closes the connection gracefully.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: PortAddr,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<Event>,
    closed: bool,
}

impl ConnectionHandle {
    /// Connection id within the node
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address
    #[must_use]
    pub fn remote(&self) -> &PortAddr {
        &self.remote
    }

    /// Send bytes, returning how many the connection accepted
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Core` if the connection cannot send any more.
    pub async fn send(&self, data: &[u8]) -> Result<usize, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                id: self.id,
                data: data.to_vec(),
                reply,
            })
            .map_err(|_| NodeError::channel("event loop stopped"))?;
        rx.await
            .map_err(|_| NodeError::channel("event loop dropped send"))?
    }

    /// Next event; `None` after `Closed`
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, Some(Event::Closed) | None) {
            self.closed = true;
        }
        event
    }

    /// Next received bytes; `None` once the peer half-closed or the
    /// connection ended
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        while let Some(event) = self.next_event().await {
            match event {
                Event::Data(bytes) => return Some(bytes),
                Event::End | Event::Error(_) | Event::Closed => return None,
                _ => {}
            }
        }
        None
    }

    /// Close the connection; `force` skips the half-close exchange
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Channel` if the node stopped.
    pub async fn close(&self, force: bool) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Close {
                id: self.id,
                force,
                reply: Some(reply),
            })
            .map_err(|_| NodeError::channel("event loop stopped"))?;
        rx.await
            .map_err(|_| NodeError::channel("event loop dropped close"))?
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.commands.send(Command::Close {
                id: self.id,
                force: false,
                reply: None,
            });
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Connect { target, .. } => write!(f, "Connect({})", target.addr),
            Command::Listen { vport, .. } => write!(f, "Listen({})", vport),
            Command::Unlisten { vport } => write!(f, "Unlisten({})", vport),
            Command::Send { id, data, .. } => write!(f, "Send({}, {} bytes)", id, data.len()),
            Command::Close { id, force, .. } => write!(f, "Close({}, force={})", id, force),
            Command::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

// ============================================================================
// Event loop
// ============================================================================

struct PunchedSocket {
    socket: DatagramSocket,
    task: JoinHandle<()>,
}

struct Driver {
    stack: Stack,
    config: NodeConfig,
    primary: DatagramSocket,
    primary_task: JoinHandle<()>,
    punched: HashMap<SocketId, PunchedSocket>,
    next_socket: u64,
    finder: Option<Arc<dyn PeerFinder>>,
    commands: mpsc::WeakUnboundedSender<Command>,
    inbound: mpsc::Sender<Datagram>,
    lookups: mpsc::UnboundedSender<Lookup>,
    conn_events: HashMap<ConnectionId, mpsc::UnboundedSender<Event>>,
    listeners: HashMap<VPort, mpsc::UnboundedSender<ConnectionHandle>>,
}

fn spawn_receiver(
    socket: DatagramSocket,
    which: SocketRef,
    tx: mpsc::Sender<Datagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut errors = 0u32;
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    errors = 0;
                    let datagram = Datagram {
                        socket: which,
                        from,
                        bytes: buf[..n].to_vec(),
                    };
                    if tx.send(datagram).await.is_err() {
                        break;
                    }
                }
                Err(NodeError::Closed) => break,
                Err(e) => {
                    let pause = recv_retry_delay(errors);
                    errors = errors.saturating_add(1);
                    tracing::debug!(
                        "receive on {:?} failed ({} in a row), retrying in {:?}: {}",
                        which,
                        errors,
                        pause,
                        e
                    );
                    tokio::time::sleep(pause).await;
                }
            }
        }
    })
}

/// Pause before retrying after `errors` consecutive receive failures
fn recv_retry_delay(errors: u32) -> Duration {
    RECV_RETRY_BASE
        .saturating_mul(1 << errors.min(RECV_RETRY_MAX_SHIFT))
        .min(RECV_RETRY_MAX)
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Datagram>,
        mut lookups: mpsc::UnboundedReceiver<Lookup>,
    ) {
        loop {
            let deadline = self.stack.poll_timeout().map(tokio::time::Instant::from_std);
            let sleep = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| tokio::time::Instant::now() + FAR_FUTURE),
            );
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(datagram) = inbound.recv() => self.datagram(datagram),
                Some(lookup) = lookups.recv() => self.lookup(lookup),
                () = sleep, if deadline.is_some() => self.stack.handle_timeout(now()),
            }
            self.flush().await;
        }
    }

    fn command(&mut self, command: Command) {
        tracing::trace!("command {:?}", command);
        let now = now();
        match command {
            Command::Connect {
                target,
                options,
                reply,
            } => match self.stack.open(target, options, now) {
                Ok(id) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.conn_events.insert(id, tx);
                    let _ = reply.send(Ok((id, rx)));
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::Listen {
                vport,
                options,
                reply,
            } => match self.stack.listen(vport, options) {
                Ok(()) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.listeners.insert(vport, tx);
                    let _ = reply.send(Ok(rx));
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            },
            Command::Unlisten { vport } => {
                if self.listeners.remove(&vport).is_some() {
                    let _ = self.stack.unlisten(vport);
                }
            }
            Command::Send { id, data, reply } => {
                let result = self.stack.send(id, &data, now).map_err(NodeError::from);
                let _ = reply.send(result);
            }
            Command::Close { id, force, reply } => {
                let result = self.stack.close(id, force, now).map_err(NodeError::from);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn datagram(&mut self, datagram: Datagram) {
        let inbound = Inbound {
            socket: datagram.socket,
            endpoint: Endpoint::udp(datagram.from),
        };
        if let Err(e) = self.stack.handle_datagram(inbound, &datagram.bytes, now()) {
            tracing::debug!("dropping datagram from {}: {}", datagram.from, e);
        }
    }

    fn lookup(&mut self, lookup: Lookup) {
        let now = now();
        match lookup {
            Lookup::Sn { id, lookup, peers } => self.stack.handle_sn_found(id, lookup, peers, now),
            Lookup::Peer { id, lookup, info } => {
                self.stack.handle_peer_found(id, lookup, info, now);
            }
        }
    }

    /// Drain the stack until it has nothing left to say
    async fn flush(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(transmit) = self.stack.poll_transmit() {
                self.transmit(transmit).await;
                progressed = true;
            }
            while let Some((id, request)) = self.stack.poll_request() {
                self.request(id, request);
                progressed = true;
            }
            while let Some((id, event)) = self.stack.poll_event() {
                self.event(id, event);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    async fn transmit(&mut self, transmit: Transmit) {
        let socket = match transmit.socket {
            SocketRef::Primary => &self.primary,
            SocketRef::Punched(id) => match self.punched.get(&id) {
                Some(punched) => &punched.socket,
                None => {
                    tracing::debug!("punched socket {} gone, dropping transmit", id);
                    return;
                }
            },
        };
        let bytes = match transmit.packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("failed to encode {:?}: {}", transmit.packet.kind(), e);
                return;
            }
        };
        for dest in &transmit.destinations {
            if !dest.is_udp() {
                tracing::trace!("skipping stream destination {}", dest);
                continue;
            }
            if let Err(e) = socket.send_to(&bytes, dest.addr).await {
                tracing::debug!("send to {} failed: {}", dest, e);
            }
        }
    }

    fn request(&mut self, id: ConnectionId, request: Request) {
        match request {
            Request::FindSn {
                lookup,
                peer,
                from_cache,
            } => {
                let Some(finder) = self.finder.clone() else {
                    self.stack.handle_sn_found(id, lookup, Vec::new(), now());
                    return;
                };
                let tx = self.lookups.clone();
                tokio::spawn(async move {
                    let peers = finder.find_sn(&peer, from_cache).await.unwrap_or_else(|e| {
                        tracing::debug!("signaling lookup for {} failed: {}", peer, e);
                        Vec::new()
                    });
                    let _ = tx.send(Lookup::Sn { id, lookup, peers });
                });
            }
            Request::FindPeer { lookup, peer } => {
                let Some(finder) = self.finder.clone() else {
                    self.stack.handle_peer_found(id, lookup, None, now());
                    return;
                };
                let tx = self.lookups.clone();
                tokio::spawn(async move {
                    let info = match finder.find_peer(&peer).await {
                        Ok(info) => Some(info),
                        Err(e) => {
                            tracing::debug!("locating {} failed: {}", peer, e);
                            None
                        }
                    };
                    let _ = tx.send(Lookup::Peer { id, lookup, info });
                });
            }
            Request::OpenPunchedSocket(ticket) => self.open_punched(id, ticket),
            Request::ReleaseSocket(socket) => {
                if let Some(punched) = self.punched.remove(&socket) {
                    punched.socket.close();
                    punched.task.abort();
                    tracing::debug!("released punched socket {}", socket);
                }
            }
            Request::WatchSocket(socket) | Request::UnwatchSocket(socket) => {
                tracing::trace!("no stream substrate to watch {:?}", socket);
            }
        }
    }

    fn open_punched(&mut self, id: ConnectionId, ticket: PunchTicket) {
        let ip = self.primary.local_addr().map_or_else(
            |_| self.config.listen_addr.ip(),
            |addr| addr.ip(),
        );
        let opened = DatagramSocket::bind(SocketAddr::new(ip, 0), self.config.socket_buffer_size)
            .and_then(|socket| socket.local_addr().map(|addr| (socket, addr)));
        let result = match opened {
            Ok((socket, addr)) => {
                self.next_socket += 1;
                let socket_id = SocketId(self.next_socket);
                let task = spawn_receiver(
                    socket.clone(),
                    SocketRef::Punched(socket_id),
                    self.inbound.clone(),
                );
                self.punched.insert(socket_id, PunchedSocket { socket, task });
                let advertised_ip = self
                    .stack
                    .context()
                    .endpoints
                    .iter()
                    .find(|ep| ep.is_udp())
                    .map_or(addr.ip(), |ep| ep.addr.ip());
                tracing::debug!("opened punched socket {} on {}", socket_id, addr);
                Some((socket_id, Endpoint::udp(SocketAddr::new(advertised_ip, addr.port()))))
            }
            Err(e) => {
                tracing::warn!("failed to open punched socket: {}", e);
                None
            }
        };
        self.stack.handle_punched_socket(id, ticket, result, now());
    }

    fn event(&mut self, id: ConnectionId, event: Event) {
        tracing::trace!("{} event {:?}", id, event);
        if event == Event::Accepted {
            self.accepted(id);
            return;
        }
        let closed = event == Event::Closed;
        if let Some(tx) = self.conn_events.get(&id) {
            let _ = tx.send(event);
        }
        if closed {
            self.conn_events.remove(&id);
        }
    }

    fn accepted(&mut self, id: ConnectionId) {
        let Some(conn) = self.stack.connection(id) else {
            return;
        };
        let vport = conn.local().vport;
        let remote = conn
            .remote()
            .cloned()
            .unwrap_or_else(|| self.stack.local_addr(vport));
        let (Some(listener), Some(commands)) =
            (self.listeners.get(&vport), self.commands.upgrade())
        else {
            let _ = self.stack.close(id, true, now());
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle {
            id,
            remote,
            commands,
            events: rx,
            closed: false,
        };
        if listener.send(handle).is_ok() {
            self.conn_events.insert(id, tx);
        }
        // a refused handle closes itself on drop
    }

    async fn shutdown(&mut self) {
        self.primary.close();
        let now = now();
        self.stack.handle_socket_closed(SocketRef::Primary, now);
        let punched: Vec<SocketId> = self.punched.keys().copied().collect();
        for socket in punched {
            self.stack.handle_socket_closed(SocketRef::Punched(socket), now);
        }
        self.flush().await;
        for (_, punched) in self.punched.drain() {
            punched.socket.close();
            punched.task.abort();
        }
        self.primary_task.abort();
        self.listeners.clear();
        self.conn_events.clear();
    }
}

/// Sleep target when no timer is armed; the branch is disabled anyway
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ConnectError, StackConfig};

    fn config(peer: &str) -> NodeConfig {
        NodeConfig::new(PeerId::new(peer))
    }

    #[test]
    fn test_receive_retry_delay_backs_off_and_caps() {
        assert_eq!(recv_retry_delay(0), Duration::from_millis(5));
        assert_eq!(recv_retry_delay(1), Duration::from_millis(10));
        assert_eq!(recv_retry_delay(3), Duration::from_millis(40));
        assert_eq!(recv_retry_delay(7), RECV_RETRY_MAX);
        assert_eq!(recv_retry_delay(u32::MAX), RECV_RETRY_MAX);
    }

    #[tokio::test]
    async fn test_bind_advertises_bound_address() {
        let node = Node::bind(config("alice"), None).await.unwrap();
        assert_eq!(node.endpoints(), &[Endpoint::udp(node.local_addr())]);
        assert_ne!(node.local_addr().port(), 0);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_twice_rejected() {
        let node = Node::bind(config("alice"), None).await.unwrap();
        let _listener = node.listen(80, ConnectionOptions::default()).await.unwrap();
        assert!(matches!(
            node.listen(80, ConnectionOptions::default()).await,
            Err(NodeError::Core(tether_core::Error::VPortInUse(80)))
        ));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_candidates_fails() {
        let stack = StackConfig {
            connect_timeout: std::time::Duration::from_millis(300),
            try_connect_interval: std::time::Duration::from_millis(100),
            ..StackConfig::default()
        };
        let node = Node::bind(config("alice").with_stack(stack), None).await.unwrap();
        let target = ConnectTarget::new(PortAddr::new("bob", 80));
        let result = node.connect(target, ConnectionOptions::default()).await;
        assert!(matches!(
            result,
            Err(NodeError::Connect(ConnectError::Timeout))
        ));
        node.shutdown().await.unwrap();
    }
}
