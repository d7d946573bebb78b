//! Error types for the node API.

use std::borrow::Cow;
use tether_core::ConnectError;
use thiserror::Error;

/// Errors returned by [`crate::Node`] and its handles
#[derive(Debug, Error)]
pub enum NodeError {
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket could not be created or bound
    #[error("failed to bind: {0}")]
    BindFailed(Cow<'static, str>),

    /// The protocol stack refused the operation
    #[error("stack error: {0}")]
    Core(#[from] tether_core::Error),

    /// Connection attempt ended with a terminal error
    #[error("connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// Connection or node already closed
    #[error("closed")]
    Closed,

    /// The event loop went away
    #[error("channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Node configuration rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl NodeError {
    /// Bind failure with context
    #[must_use]
    pub fn bind_failed(context: impl Into<Cow<'static, str>>) -> Self {
        NodeError::BindFailed(context.into())
    }

    /// Channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        NodeError::Channel(Cow::Borrowed(context))
    }

    /// Whether retrying the same operation later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Io(_) => true,
            NodeError::Connect(e) => e.is_reachability(),
            _ => false,
        }
    }
}
