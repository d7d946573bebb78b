//! Error types for the tether protocol core.

use crate::connection::State;
use crate::endpoint::VPort;
use crate::stack::ConnectionId;
use std::borrow::Cow;
use thiserror::Error;

/// Core errors returned synchronously from API calls
#[derive(Debug, Error)]
pub enum Error {
    /// Operation not valid in the connection's current state
    #[error("invalid state for operation: {0:?}")]
    InvalidState(State),

    /// Connection has no local virtual port
    #[error("connection is not bound")]
    NotBound,

    /// Connect called on a connection that already started
    #[error("connection already started")]
    AlreadyConnected,

    /// Virtual port taken by another connection or listener
    #[error("virtual port {0} already in use")]
    VPortInUse(VPort),

    /// Ephemeral virtual port range exhausted
    #[error("no free virtual port")]
    NoFreeVPort,

    /// Session id space exhausted
    #[error("no free session id")]
    NoFreeSession,

    /// No listener registered on the virtual port
    #[error("no listener on virtual port {0}")]
    NoListener(VPort),

    /// Connection id not known to the stack
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Packet codec failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Terminal connection failure
    #[error("connection failed: {0}")]
    Connect(#[from] ConnectError),
}

/// Terminal reasons a connection fails
///
/// Delivered exactly once per connection through the error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Candidate endpoints were known but none answered
    #[error("remote did not answer on any candidate endpoint")]
    RemoteUnresponsive,

    /// No signaling peer and no endpoint for the remote
    #[error("no route to remote")]
    NoRoute,

    /// Signaling peers were found but none responded
    #[error("signaling peers did not respond")]
    SignalingSilent,

    /// Signaling peers responded without any remote address
    #[error("signaling returned no address for remote")]
    NoAddressFromSignaling,

    /// Connect timeout with no better diagnosis
    #[error("connect timed out")]
    Timeout,

    /// Nothing heard from the remote past the break threshold
    #[error("remote went silent")]
    RemoteSilent,

    /// The underlying socket was closed
    #[error("transport closed")]
    TransportClosed,
}

impl ConnectError {
    /// Failure to reach the remote during establishment
    #[must_use]
    pub const fn is_reachability(&self) -> bool {
        matches!(
            self,
            Self::RemoteUnresponsive
                | Self::NoRoute
                | Self::SignalingSilent
                | Self::NoAddressFromSignaling
                | Self::Timeout
        )
    }

    /// Loss of an established connection
    #[must_use]
    pub const fn is_liveness(&self) -> bool {
        matches!(self, Self::RemoteSilent | Self::TransportClosed)
    }
}

/// Packet encode/decode errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Malformed input
    #[error("decode failed: {0}")]
    Decode(String),

    /// Packet exceeds the maximum size
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}
