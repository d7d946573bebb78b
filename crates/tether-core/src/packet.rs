//! Typed protocol packets and their codec.
//!
//! The state machine only ever sees [`Packet`] values. The byte layout is
//! whatever bincode produces for these types; nothing in the core depends
//! on it.

use crate::endpoint::{Endpoint, PeerId, PeerInfo, PortAddr, SessionId};
use crate::error::CodecError;
use crate::seq::Seq;
use serde::{Deserialize, Serialize};

/// Upper bound on an encoded packet
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Command kind carried in every packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Direct handshake initiation
    Syn,
    /// Handshake reply
    SynAck,
    /// Acknowledgement of the handshake reply
    SynAckAck,
    /// Rendezvous request sent to a signaling peer
    CallReq,
    /// Signaling peer's answer to a call
    CallResp,
    /// Rendezvous request relayed by a signaling peer to the callee
    CalledReq,
    /// Callee's answer to a relayed call
    CalledResp,
    /// Stream data (an empty payload is a pure acknowledgement)
    Data,
    /// Half-close
    Fin,
    /// Keepalive probe
    Heartbeat,
    /// Keepalive answer
    HeartbeatResp,
}

impl PacketKind {
    /// Sequence units consumed by a packet of this kind, excluding payload
    #[must_use]
    pub const fn seq_cost(self) -> usize {
        match self {
            Self::Syn | Self::SynAck | Self::SynAckAck | Self::Fin => 1,
            _ => 0,
        }
    }
}

/// Fixed header fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Command kind
    pub kind: PacketKind,
    /// Whether the sender runs this connection over TCP
    pub use_tcp: bool,
    /// Sender's sequence number for this packet
    pub seq: Seq,
    /// Next sequence the sender expects from us
    pub ack_seq: Seq,
    /// Sending peer and vport
    pub src: PortAddr,
    /// Destination peer and vport
    pub dest: PortAddr,
    /// Sender's session id, when it has one
    pub src_session: Option<SessionId>,
    /// Receiver's session id, once the sender has learned it
    pub dest_session: Option<SessionId>,
}

/// Kind-specific body fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    /// Candidate endpoints advertised for a peer
    pub endpoints: Vec<Endpoint>,
    /// Endpoints of punched sockets, candidates for port prediction
    pub dynamics: Vec<Endpoint>,
    /// Another signaling peer closer to the target
    pub near_sn: Option<PeerInfo>,
    /// Signaling peer that produced a call response
    pub responder: Option<PeerId>,
    /// Set on packets sent through a punched socket
    pub is_dynamic: bool,
    /// Milliseconds since the signaling peer last heard from the target
    pub endpoint_age_ms: Option<u64>,
    /// Application payload
    pub payload: Vec<u8>,
}

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Header
    pub header: Header,
    /// Body
    pub body: Body,
}

impl Packet {
    /// Create a packet with an empty body
    #[must_use]
    pub fn new(kind: PacketKind, src: PortAddr, dest: PortAddr) -> Self {
        Self {
            header: Header {
                kind,
                use_tcp: false,
                seq: Seq::ZERO,
                ack_seq: Seq::ZERO,
                src,
                dest,
                src_session: None,
                dest_session: None,
            },
            body: Body::default(),
        }
    }

    /// Command kind
    #[must_use]
    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    /// Sequence number following this packet
    #[must_use]
    pub fn next_seq(&self) -> Seq {
        self.header
            .seq
            .add(self.header.kind.seq_cost() + self.body.payload.len())
    }

    /// Serialize to bytes
    ///
    /// # Errors
    ///
    /// Returns `CodecError::TooLarge` if the encoding exceeds
    /// [`MAX_PACKET_SIZE`], or `CodecError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let bytes = bincode::serialize(self).map_err(|e| CodecError::Encode(e.to_string()))?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Deserialize from bytes
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge(bytes.len()));
        }
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
