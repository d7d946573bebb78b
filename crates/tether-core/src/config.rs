//! Stack and per-connection configuration.

use crate::endpoint::VPort;
use crate::error::Error;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Timing and policy shared by every connection of a stack
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Give up establishing after this long
    pub connect_timeout: Duration,
    /// Period of the candidate prober and of rendezvous re-calls
    pub try_connect_interval: Duration,
    /// Initial delay between signaling-peer lookups
    pub try_find_sn_interval: Duration,
    /// Heartbeat tick period
    pub heartbeat_interval: Duration,
    /// Silence after which heartbeats start
    pub heartbeat_begin_timeout: Duration,
    /// Silence after which the connection breaks
    pub break_timeout: Duration,
    /// Maximum segment lifetime; time-wait lingers twice this
    pub msl: Duration,
    /// Ports guessed on each side of a candidate near timeout (0 disables)
    pub dynamic_expand: u16,
    /// Use signaling peers and the peer locator when connecting
    pub rendezvous: bool,
    /// Virtual ports handed out to outgoing connections
    pub ephemeral_vports: RangeInclusive<VPort>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            try_connect_interval: Duration::from_secs(1),
            try_find_sn_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_begin_timeout: Duration::from_secs(8),
            break_timeout: Duration::from_secs(60),
            msl: Duration::from_secs(5),
            dynamic_expand: 0,
            rendezvous: true,
            ephemeral_vports: 32768..=65535,
        }
    }
}

impl StackConfig {
    /// Linger time in time-wait
    #[must_use]
    pub fn linger(&self) -> Duration {
        self.msl * 2
    }

    /// Check that the values are usable together
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.try_connect_interval.is_zero() {
            return Err(Error::InvalidConfig("try_connect_interval must be non-zero".into()));
        }
        if self.try_find_sn_interval.is_zero() {
            return Err(Error::InvalidConfig("try_find_sn_interval must be non-zero".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat_interval must be non-zero".into()));
        }
        if self.connect_timeout < self.try_connect_interval {
            return Err(Error::InvalidConfig(
                "connect_timeout shorter than try_connect_interval".into(),
            ));
        }
        if self.heartbeat_begin_timeout >= self.break_timeout {
            return Err(Error::InvalidConfig(
                "heartbeat_begin_timeout must be below break_timeout".into(),
            ));
        }
        if self.ephemeral_vports.is_empty() || *self.ephemeral_vports.start() == 0 {
            return Err(Error::InvalidConfig(
                "ephemeral_vports must be a non-empty range above zero".into(),
            ));
        }
        Ok(())
    }
}

/// Per-connection options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Keep sending after the peer half-closed instead of closing too
    pub allow_half_open: bool,
}
