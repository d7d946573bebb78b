//! # Tether Core
//!
//! Sans-IO connection establishment between peers that may sit behind NATs.
//!
//! This crate provides:
//! - The three-way handshake and the connection state machine
//! - The candidate prober with port prediction
//! - Rendezvous through signaling peers, including punched sockets
//! - Heartbeat liveness and silent-peer detection
//! - Wrapping sequence numbers and the early-data buffer
//! - Packet encoding and decoding
//!
//! Nothing here touches a socket or a clock. Every entry point takes `now`,
//! and outputs (packets, events, requests for the environment) are drained
//! with `poll_*` methods. `tether-transport` drives a [`Stack`] over real UDP
//! sockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Stack                                  │
//! │   (routing by session / listener, vports, remote filter)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Connection                               │
//! │   (state machine, cached replies, early data, heartbeat)         │
//! ├──────────────────────┬──────────────────────┬───────────────────┤
//! │      TryConnect      │        SnCall        │     Transfer      │
//! │  (candidate prober)  │  (rendezvous calls)  │  (data after      │
//! │                      │                      │   establishment)  │
//! ├──────────────────────┴──────────────────────┴───────────────────┤
//! │                     Sender / Packet                              │
//! │   (candidate endpoints, socket binding, wire format)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod early_data;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod heartbeat;
pub mod output;
pub mod packet;
pub mod sender;
pub mod seq;
pub mod sn_call;
pub mod stack;
pub mod transfer;
pub mod try_connect;

pub use config::{ConnectionOptions, StackConfig};
pub use connection::{ConnectTarget, Connection, Origin, State};
pub use endpoint::{Endpoint, PeerId, PeerInfo, PortAddr, Protocol, SessionId, VPort};
pub use error::{CodecError, ConnectError, Error};
pub use filter::RemoteFilter;
pub use output::{Event, LookupId, PunchTicket, Request};
pub use packet::{Packet, PacketKind};
pub use sender::{Inbound, SocketId, SocketRef, Transmit};
pub use seq::Seq;
pub use stack::{ConnectionId, Context, Stack};
pub use transfer::{DatagramTransferFactory, Transfer, TransferFactory};
