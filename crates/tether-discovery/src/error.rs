//! Resolver errors.

use thiserror::Error;

/// Errors returned by a [`crate::PeerFinder`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// The resolver does not implement this lookup
    #[error("lookup not supported by this resolver")]
    NotSupported,

    /// Nothing is known about the peer
    #[error("peer not found")]
    NotFound,

    /// The resolver could not be reached
    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

impl DiscoveryError {
    /// Whether retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
