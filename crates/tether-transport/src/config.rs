//! Node configuration.

use crate::error::NodeError;
use std::net::SocketAddr;
use tether_core::{Endpoint, PeerId, StackConfig};

/// Default socket send and receive buffer size (2 MiB)
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Configuration of a [`crate::Node`]
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local peer id
    pub peer_id: PeerId,

    /// Address of the primary UDP socket
    pub listen_addr: SocketAddr,

    /// Endpoints announced to remotes; the bound address when empty
    pub advertised: Vec<Endpoint>,

    /// Protocol timers and switches
    pub stack: StackConfig,

    /// Send and receive buffer size of every socket
    pub socket_buffer_size: usize,
}

impl NodeConfig {
    /// Defaults for `peer_id`, bound to an ephemeral loopback port
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertised: Vec::new(),
            stack: StackConfig::default(),
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
        }
    }

    /// Bind the primary socket to `addr`
    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Replace the protocol configuration
    #[must_use]
    pub fn with_stack(mut self, stack: StackConfig) -> Self {
        self.stack = stack;
        self
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidConfig` or the stack's own rejection.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.peer_id.as_str().is_empty() {
            return Err(NodeError::InvalidConfig("peer_id must not be empty".into()));
        }
        if self.socket_buffer_size == 0 {
            return Err(NodeError::InvalidConfig(
                "socket_buffer_size must be non-zero".into(),
            ));
        }
        if let Some(bad) = self.advertised.iter().find(|ep| !ep.is_routable()) {
            return Err(NodeError::InvalidConfig(
                format!("advertised endpoint {} is not routable", bad).into(),
            ));
        }
        self.stack.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(NodeConfig::new(PeerId::new("alice")).validate().is_ok());
    }

    #[test]
    fn test_rejects_unroutable_advertisement() {
        let mut config = NodeConfig::new(PeerId::new("alice"));
        config.advertised = vec!["udp:0.0.0.0:4000".parse().unwrap()];
        assert!(matches!(config.validate(), Err(NodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_stack_errors_surface() {
        let mut config = NodeConfig::new(PeerId::new("alice"));
        config.stack.heartbeat_interval = std::time::Duration::ZERO;
        assert!(matches!(config.validate(), Err(NodeError::Core(_))));
    }
}
