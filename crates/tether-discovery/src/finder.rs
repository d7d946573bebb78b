//! The resolver interface.

use crate::error::DiscoveryError;
use async_trait::async_trait;
use tether_core::{PeerId, PeerInfo};

/// Resolves signaling peers and endpoints of remote peers
///
/// Implementations must be cheap to call concurrently; the transport spawns
/// one task per lookup.
#[async_trait]
pub trait PeerFinder: Send + Sync {
    /// Signaling peers able to relay a call to `peer`
    ///
    /// With `from_cache` set only locally known entries are returned and no
    /// network round trip is made. An empty list is a valid answer.
    async fn find_sn(
        &self,
        peer: &PeerId,
        from_cache: bool,
    ) -> Result<Vec<PeerInfo>, DiscoveryError>;

    /// Endpoints `peer` announced through the generic locator
    async fn find_peer(&self, peer: &PeerId) -> Result<PeerInfo, DiscoveryError> {
        let _ = peer;
        Err(DiscoveryError::NotSupported)
    }
}
