//! Liveness tracking for established connections.

use crate::config::StackConfig;
use std::time::{Duration, Instant};

/// What a heartbeat tick asks the connection to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tick {
    /// Send a heartbeat packet
    pub send: bool,
    /// Mark the socket binding stale
    pub mark_stale: bool,
    /// Remote silent past the break threshold
    pub broken: bool,
}

/// Periodic silence detector
#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    begin: Duration,
    break_after: Duration,
    last_recv: Instant,
    next_tick: Instant,
    silent_ticks: u32,
}

impl Heartbeat {
    /// Start ticking from `now`
    #[must_use]
    pub fn new(config: &StackConfig, now: Instant) -> Self {
        Self {
            interval: config.heartbeat_interval,
            begin: config.heartbeat_begin_timeout,
            break_after: config.break_timeout,
            last_recv: now,
            next_tick: now + config.heartbeat_interval,
            silent_ticks: 0,
        }
    }

    /// Record that something arrived from the remote
    pub fn on_recv(&mut self, now: Instant) {
        self.last_recv = now;
    }

    /// Last time anything arrived
    #[must_use]
    pub fn last_recv(&self) -> Instant {
        self.last_recv
    }

    /// Next tick
    #[must_use]
    pub fn poll_timeout(&self) -> Instant {
        self.next_tick
    }

    /// Run the tick if due
    ///
    /// `last_send` is the last time the connection posted anything.
    pub fn handle_timeout(&mut self, now: Instant, last_send: Instant) -> Option<Tick> {
        if now < self.next_tick {
            return None;
        }
        self.next_tick = now + self.interval;

        let gap = now.saturating_duration_since(self.last_recv);
        let mut tick = Tick::default();
        if gap > self.begin {
            self.silent_ticks += 1;
            tick.mark_stale = self.silent_ticks % 3 == 0;
            if gap > self.break_after {
                tracing::warn!("no packet from remote for {:?}", gap);
                tick.broken = true;
            } else if now.saturating_duration_since(last_send) >= self.interval {
                tick.send = true;
            }
        } else {
            self.silent_ticks = 0;
        }
        Some(tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StackConfig {
        StackConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_begin_timeout: Duration::from_secs(3),
            break_timeout: Duration::from_secs(10),
            ..StackConfig::default()
        }
    }

    #[test]
    fn test_quiet_until_begin_threshold() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(&config(), t0);
        assert!(hb.handle_timeout(t0, t0).is_none());

        for s in 1..=3 {
            let now = t0 + Duration::from_secs(s);
            assert_eq!(hb.handle_timeout(now, t0), Some(Tick::default()));
        }
        let tick = hb.handle_timeout(t0 + Duration::from_secs(4), t0).unwrap();
        assert!(tick.send);
        assert!(!tick.broken);
    }

    #[test]
    fn test_every_third_silent_tick_marks_stale() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(&config(), t0);
        let stale: Vec<bool> = (4..=9)
            .map(|s| {
                let now = t0 + Duration::from_secs(s);
                hb.handle_timeout(now, now).unwrap().mark_stale
            })
            .collect();
        assert_eq!(stale, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn test_recent_send_suppresses_heartbeat() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(&config(), t0);
        let now = t0 + Duration::from_secs(5);
        hb.next_tick = now;
        let tick = hb.handle_timeout(now, now - Duration::from_millis(200)).unwrap();
        assert!(!tick.send);
    }

    #[test]
    fn test_breaks_after_threshold_and_recv_resets() {
        let t0 = Instant::now();
        let mut hb = Heartbeat::new(&config(), t0);
        hb.on_recv(t0 + Duration::from_secs(5));
        hb.next_tick = t0 + Duration::from_secs(6);
        assert!(!hb.handle_timeout(t0 + Duration::from_secs(6), t0).unwrap().broken);

        hb.next_tick = t0 + Duration::from_secs(16);
        let tick = hb.handle_timeout(t0 + Duration::from_secs(16), t0).unwrap();
        assert!(tick.broken);
        assert!(!tick.send);
    }
}
