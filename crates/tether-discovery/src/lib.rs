//! # Tether Discovery
//!
//! Peer resolution for the Tether connection protocol.
//!
//! The core asks its environment two questions while connecting:
//! - which signaling peers can relay a call to a peer (`find_sn`), from a
//!   local cache or from the network
//! - where a peer can be reached directly (`find_peer`), through a generic
//!   locator such as a DHT
//!
//! [`PeerFinder`] is that interface. [`Directory`] is an in-memory resolver
//! with a cache tier and a network tier, used for local deployments and
//! tests.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_core::{PeerId, PeerInfo};
//! use tether_discovery::{Directory, PeerFinder};
//!
//! # async fn demo() {
//! let directory = Directory::new();
//! let sn = PeerInfo::new("sn-1", vec!["udp:192.0.2.1:9000".parse().unwrap()]);
//! directory.publish_sn(PeerId::new("bob"), vec![sn]).await;
//!
//! let found = directory.find_sn(&PeerId::new("bob"), false).await.unwrap();
//! assert_eq!(found.len(), 1);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod directory;
pub mod error;
pub mod finder;

pub use directory::Directory;
pub use error::DiscoveryError;
pub use finder::PeerFinder;
