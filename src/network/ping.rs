//! Keep-alive flood guard.
//!
//! Tight ping loops are an abuse vector, so exceeding the over-speed
//! threshold closes the connection instead of silently dropping pings.

use std::time::{Duration, Instant};

use crate::config::PingPolicy;

/// Outcome of one ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingVerdict {
    Accepted,
    /// Over-speed threshold exceeded; carries the counter value.
    Flood(u32),
}

#[derive(Debug)]
pub struct PingGuard {
    policy: PingPolicy,
    last_ping: Option<Instant>,
    overspeed: u32,
}

impl PingGuard {
    pub fn new(policy: PingPolicy) -> Self {
        Self {
            policy,
            last_ping: None,
            overspeed: 0,
        }
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.last_ping
    }

    pub fn overspeed(&self) -> u32 {
        self.overspeed
    }

    /// Time since the previous ping, if any.
    pub fn interval_since_last(&self, now: Instant) -> Option<Duration> {
        self.last_ping.map(|last| now.saturating_duration_since(last))
    }

    /// Record a ping received at `now`.
    pub fn on_ping(&mut self, now: Instant) -> PingVerdict {
        let Some(last) = self.last_ping.replace(now) else {
            return PingVerdict::Accepted;
        };

        if now.saturating_duration_since(last) < self.policy.min_interval() {
            self.overspeed = self.overspeed.saturating_add(1);
            let max = self.policy.max_overspeed;
            if max != 0 && self.overspeed > max {
                return PingVerdict::Flood(self.overspeed);
            }
        } else {
            self.overspeed = 0;
        }

        PingVerdict::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(min_secs: u64, max: u32) -> PingPolicy {
        PingPolicy {
            min_interval_ms: min_secs * 1000,
            max_overspeed: max,
        }
    }

    #[test]
    fn test_first_ping_only_records() {
        let mut guard = PingGuard::new(policy(27, 2));
        let now = Instant::now();
        assert_eq!(guard.on_ping(now), PingVerdict::Accepted);
        assert_eq!(guard.last_ping(), Some(now));
        assert_eq!(guard.overspeed(), 0);
    }

    #[test]
    fn test_third_fast_ping_floods() {
        let mut guard = PingGuard::new(policy(27, 2));
        let t0 = Instant::now();
        assert_eq!(guard.on_ping(t0), PingVerdict::Accepted);
        assert_eq!(guard.on_ping(t0 + Duration::from_secs(1)), PingVerdict::Accepted);
        assert_eq!(guard.on_ping(t0 + Duration::from_secs(2)), PingVerdict::Accepted);
        assert_eq!(guard.on_ping(t0 + Duration::from_secs(3)), PingVerdict::Flood(3));
    }

    #[test]
    fn test_compliant_ping_resets_counter() {
        let mut guard = PingGuard::new(policy(27, 2));
        let mut t = Instant::now();
        guard.on_ping(t);
        for _ in 0..2 {
            t += Duration::from_secs(1);
            guard.on_ping(t);
        }
        assert_eq!(guard.overspeed(), 2);

        t += Duration::from_secs(30);
        assert_eq!(guard.on_ping(t), PingVerdict::Accepted);
        assert_eq!(guard.overspeed(), 0);

        // two more fast ones are tolerated again
        t += Duration::from_secs(1);
        assert_eq!(guard.on_ping(t), PingVerdict::Accepted);
        t += Duration::from_secs(1);
        assert_eq!(guard.on_ping(t), PingVerdict::Accepted);
    }

    #[test]
    fn test_exact_minimum_interval_is_compliant() {
        let mut guard = PingGuard::new(policy(27, 2));
        let mut t = Instant::now();
        for _ in 0..1000 {
            assert_eq!(guard.on_ping(t), PingVerdict::Accepted);
            t += Duration::from_secs(27);
        }
        assert_eq!(guard.overspeed(), 0);
    }

    #[test]
    fn test_zero_threshold_disables_cutoff() {
        let mut guard = PingGuard::new(policy(27, 0));
        let t = Instant::now();
        for i in 0..100 {
            assert_eq!(guard.on_ping(t + Duration::from_millis(i)), PingVerdict::Accepted);
        }
        assert_eq!(guard.overspeed(), 99);
    }

    #[test]
    fn test_overspeed_counter_saturates() {
        let mut guard = PingGuard::new(policy(27, 0));
        let t = Instant::now();
        guard.on_ping(t);
        guard.overspeed = u32::MAX - 1;
        assert_eq!(guard.on_ping(t), PingVerdict::Accepted);
        assert_eq!(guard.on_ping(t), PingVerdict::Accepted);
        assert_eq!(guard.overspeed(), u32::MAX);
    }
}
