//! Candidate prober.
//!
//! Retries the current handshake packet toward every known candidate on a
//! fixed tick until the connection establishes or the connect timeout runs
//! out. The connection owns the senders; this session owns the schedule,
//! the attempt counter, the port-prediction set and the timeout diagnosis.

use crate::endpoint::Endpoint;
use crate::error::ConnectError;
use crate::packet::Packet;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Retry this many intervals before timeout counts as "near"
const NEAR_TIMEOUT_INTERVALS: u32 = 3;

/// Every this many attempts, all candidates are re-sprayed
const RESEND_ALL_EVERY: u32 = 3;

/// One prober attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// First attempt on this session
    pub first: bool,
    /// Post to every candidate instead of the active one
    pub resend_all: bool,
}

/// What was learned while connecting, used to explain a timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evidence {
    /// Candidate endpoints known for the remote
    pub candidates: usize,
    /// Rendezvous was running
    pub rendezvous: bool,
    /// Signaling peers found
    pub sn_peers: usize,
    /// Some signaling peer answered a call
    pub sn_responded: bool,
}

/// Pick the most specific failure reason
#[must_use]
pub fn diagnose(evidence: &Evidence) -> ConnectError {
    if evidence.candidates > 0 {
        ConnectError::RemoteUnresponsive
    } else if evidence.rendezvous && evidence.sn_peers == 0 {
        ConnectError::NoRoute
    } else if evidence.rendezvous && !evidence.sn_responded {
        ConnectError::SignalingSilent
    } else if evidence.rendezvous {
        ConnectError::NoAddressFromSignaling
    } else {
        ConnectError::Timeout
    }
}

/// Prober session state
#[derive(Debug)]
pub struct TryConnect {
    handshake: Packet,
    started: Instant,
    next_tick: Instant,
    tries: u32,
    dynamics: HashSet<Endpoint>,
}

impl TryConnect {
    /// Start probing with `handshake`; the first attempt is due immediately
    #[must_use]
    pub fn new(handshake: Packet, now: Instant) -> Self {
        Self {
            handshake,
            started: now,
            next_tick: now,
            tries: 0,
            dynamics: HashSet::new(),
        }
    }

    /// Packet being probed
    #[must_use]
    pub fn handshake(&self) -> &Packet {
        &self.handshake
    }

    /// Attempts made so far
    #[must_use]
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Next attempt
    #[must_use]
    pub fn poll_timeout(&self) -> Instant {
        self.next_tick
    }

    /// Whether an attempt is due
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_tick
    }

    /// Whether the connect timeout has run out
    #[must_use]
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.started) >= timeout
    }

    /// Whether fewer than a few intervals remain before timeout
    #[must_use]
    pub fn is_near_timeout(&self, now: Instant, timeout: Duration, interval: Duration) -> bool {
        let elapsed = now.saturating_duration_since(self.started);
        timeout.saturating_sub(elapsed) <= interval * NEAR_TIMEOUT_INTERVALS
    }

    /// Record a new attempt and schedule the next one
    pub fn next_attempt(&mut self, now: Instant, interval: Duration) -> Attempt {
        self.tries += 1;
        self.next_tick = now + interval;
        Attempt {
            first: self.tries == 1,
            resend_all: self.tries % RESEND_ALL_EVERY == 0,
        }
    }

    /// Remember endpoints that are themselves guesses or punched ports
    pub fn add_dynamics(&mut self, endpoints: &[Endpoint]) {
        self.dynamics.extend(endpoints.iter().copied());
    }

    /// Whether `ep` was guessed or advertised as dynamic
    #[must_use]
    pub fn is_dynamic(&self, ep: &Endpoint) -> bool {
        self.dynamics.contains(ep)
    }

    /// Port-prediction guesses around each non-guessed UDP candidate
    ///
    /// Returns only guesses not produced before and not already candidates.
    pub fn guesses(&mut self, candidates: &[Endpoint], expand: u16) -> Vec<Endpoint> {
        let mut out = Vec::new();
        for base in candidates {
            if !base.is_udp() || self.dynamics.contains(base) {
                continue;
            }
            for guess in base.neighbors(expand) {
                if !candidates.contains(&guess) && self.dynamics.insert(guess) {
                    out.push(guess);
                }
            }
        }
        if !out.is_empty() {
            tracing::debug!("guessing {} neighbouring ports", out.len());
        }
        out
    }
}
