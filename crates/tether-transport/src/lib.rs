//! # Tether Transport
//!
//! Tokio driver for the sans-IO `tether-core` stack.
//!
//! This crate provides:
//! - UDP sockets tuned through `socket2`, with traffic statistics
//! - A single event-loop task per node that owns the `Stack`, its primary
//!   socket and every punched socket
//! - Resolver lookups through a [`tether_discovery::PeerFinder`]
//! - The async application API: [`Node`], [`Listener`], [`ConnectionHandle`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_core::{ConnectTarget, ConnectionOptions, PeerId, PortAddr};
//! use tether_transport::{Node, NodeConfig};
//!
//! # async fn demo() -> Result<(), tether_transport::NodeError> {
//! let node = Node::bind(NodeConfig::new(PeerId::new("alice")), None).await?;
//! let target = ConnectTarget::new(PortAddr::new("bob", 80))
//!     .with_endpoints(vec!["udp:192.0.2.7:4000".parse().unwrap()]);
//! let mut conn = node.connect(target, ConnectionOptions::default()).await?;
//! conn.send(b"hello").await?;
//! while let Some(bytes) = conn.recv().await {
//!     println!("{} bytes", bytes.len());
//! }
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod node;
pub mod udp;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{ConnectionHandle, Listener, Node};
pub use udp::{DatagramSocket, SocketStats};
