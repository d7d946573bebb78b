//! What a connection hands back to its environment.

use crate::endpoint::{Endpoint, PeerId};
use crate::error::ConnectError;
use crate::sender::{SocketId, SocketRef, Transmit};
use std::collections::VecDeque;
use std::fmt;

/// Application-visible notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Outgoing connection established
    Connected,
    /// Incoming connection established
    Accepted,
    /// Bytes received in order
    Data(Vec<u8>),
    /// Everything accepted by `send` has been handed to the wire
    Drained,
    /// Peer half-closed its direction
    End,
    /// Terminal failure, delivered at most once
    Error(ConnectError),
    /// Connection fully closed; last event of every connection
    Closed,
}

/// Correlates a resolver request with its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupId(pub u64);

impl fmt::Display for LookupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lookup-{}", self.0)
    }
}

/// What a punched socket is opened for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PunchTicket {
    /// Second path to a signaling peer
    SnPeer(PeerId),
    /// Dynamic answer to a repeated relayed call from this endpoint
    Called(Endpoint),
}

/// Work the environment performs on a connection's behalf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Resolve the signaling peers of `peer`
    FindSn {
        /// Correlation id
        lookup: LookupId,
        /// Peer whose signaling peers are wanted
        peer: PeerId,
        /// Answer from the local cache instead of the network
        from_cache: bool,
    },
    /// Resolve endpoints of `peer` through the generic locator
    FindPeer {
        /// Correlation id
        lookup: LookupId,
        /// Peer to locate
        peer: PeerId,
    },
    /// Open a punched socket on an ephemeral port
    OpenPunchedSocket(PunchTicket),
    /// Close a punched socket
    ReleaseSocket(SocketId),
    /// Report closure and drain of a stream socket
    WatchSocket(SocketRef),
    /// Stop reporting on a stream socket
    UnwatchSocket(SocketRef),
}

/// Queues a connection fills while handling one stimulus
#[derive(Debug, Default)]
pub struct Outbox {
    /// Packets to send
    pub transmits: VecDeque<Transmit>,
    /// Application notifications
    pub events: VecDeque<Event>,
    /// Environment requests
    pub requests: VecDeque<Request>,
    next_lookup: u64,
}

impl Outbox {
    /// Allocate a lookup id unique within this connection
    pub fn lookup_id(&mut self) -> LookupId {
        self.next_lookup += 1;
        LookupId(self.next_lookup)
    }

    /// Queue a request
    pub fn request(&mut self, request: Request) {
        tracing::trace!("request {:?}", request);
        self.requests.push_back(request);
    }

    /// Queue an event
    pub fn emit(&mut self, event: Event) {
        self.events.push_back(event);
    }
}
