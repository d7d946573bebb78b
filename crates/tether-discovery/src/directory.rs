//! In-memory resolver.
//!
//! Two tiers of signaling-peer records: a local cache answered immediately,
//! and a "network" tier that costs a configurable round trip. Network
//! answers are copied into the cache, the way a real resolver remembers what
//! it fetched. Peer-locator records live in a separate table.

use crate::error::DiscoveryError;
use crate::finder::PeerFinder;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tether_core::{PeerId, PeerInfo};
use tokio::sync::RwLock;

/// In-memory [`PeerFinder`]
#[derive(Debug)]
pub struct Directory {
    cache: RwLock<HashMap<PeerId, Vec<PeerInfo>>>,
    network: RwLock<HashMap<PeerId, Vec<PeerInfo>>>,
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    latency: Duration,
    online: RwLock<bool>,
}

impl Default for Directory {
    fn default() -> Self {
        Self {
            cache: RwLock::default(),
            network: RwLock::default(),
            peers: RwLock::default(),
            latency: Duration::ZERO,
            online: RwLock::new(true),
        }
    }
}

impl Directory {
    /// Empty directory with instant network lookups
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every network-tier lookup by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Publish the signaling peers of `peer` on the network tier
    pub async fn publish_sn(&self, peer: PeerId, sns: Vec<PeerInfo>) {
        tracing::debug!("publishing {} signaling peer(s) for {}", sns.len(), peer);
        self.network.write().await.insert(peer, sns);
    }

    /// Seed the local cache for `peer`
    pub async fn cache_sn(&self, peer: PeerId, sns: Vec<PeerInfo>) {
        self.cache.write().await.insert(peer, sns);
    }

    /// Announce `info` through the peer locator
    pub async fn announce(&self, info: PeerInfo) {
        tracing::debug!("announcing {} at {} endpoint(s)", info.peer_id, info.endpoints.len());
        self.peers.write().await.insert(info.peer_id.clone(), info);
    }

    /// Forget everything about `peer`
    pub async fn remove(&self, peer: &PeerId) {
        self.cache.write().await.remove(peer);
        self.network.write().await.remove(peer);
        self.peers.write().await.remove(peer);
    }

    /// Make network lookups fail with `Unavailable` (or succeed again)
    pub async fn set_online(&self, online: bool) {
        *self.online.write().await = online;
    }

    async fn network_round_trip(&self) -> Result<(), DiscoveryError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if *self.online.read().await {
            Ok(())
        } else {
            Err(DiscoveryError::Unavailable("directory offline".into()))
        }
    }
}

#[async_trait]
impl PeerFinder for Directory {
    async fn find_sn(
        &self,
        peer: &PeerId,
        from_cache: bool,
    ) -> Result<Vec<PeerInfo>, DiscoveryError> {
        if from_cache {
            let found = self.cache.read().await.get(peer).cloned().unwrap_or_default();
            tracing::trace!("cache lookup for {}: {} signaling peer(s)", peer, found.len());
            return Ok(found);
        }
        self.network_round_trip().await?;
        let found = self.network.read().await.get(peer).cloned().unwrap_or_default();
        if !found.is_empty() {
            self.cache.write().await.insert(peer.clone(), found.clone());
        }
        tracing::trace!("network lookup for {}: {} signaling peer(s)", peer, found.len());
        Ok(found)
    }

    async fn find_peer(&self, peer: &PeerId) -> Result<PeerInfo, DiscoveryError> {
        self.network_round_trip().await?;
        self.peers
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or(DiscoveryError::NotFound)
    }
}
