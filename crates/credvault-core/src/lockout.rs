//! Master-password attempt throttling.
//!
//! Attempts live in memory only; a restart starts with an empty log.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
pub const DEFAULT_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub window: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            window: Duration::minutes(DEFAULT_WINDOW_MINUTES),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub at: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockoutStatus {
    pub allowed: bool,
    pub remaining_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockout_minutes: Option<u32>,
}

#[derive(Debug, Default)]
pub struct AttemptLog {
    attempts: VecDeque<Attempt>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune attempts outside the window and report whether another attempt
    /// may proceed.
    pub fn status(&mut self, policy: &LockoutPolicy, now: DateTime<Utc>) -> LockoutStatus {
        self.prune(policy, now);
        let failed = self.attempts.iter().filter(|a| !a.success).count() as u32;
        if failed >= policy.max_failed_attempts {
            let oldest_failure = self
                .attempts
                .iter()
                .find(|a| !a.success)
                .map(|a| a.at)
                .unwrap_or(now);
            let remaining = (oldest_failure + policy.window) - now;
            return LockoutStatus {
                allowed: false,
                remaining_attempts: 0,
                lockout_minutes: Some(ceil_minutes(remaining)),
            };
        }
        LockoutStatus {
            allowed: true,
            remaining_attempts: policy.max_failed_attempts - failed,
            lockout_minutes: None,
        }
    }

    /// Append an attempt whose outcome is already known.
    pub fn record(&mut self, success: bool, now: DateTime<Utc>) {
        self.attempts.push_back(Attempt { at: now, success });
    }

    fn prune(&mut self, policy: &LockoutPolicy, now: DateTime<Utc>) {
        let cutoff = now - policy.window;
        while let Some(front) = self.attempts.front() {
            if front.at > cutoff {
                break;
            }
            self.attempts.pop_front();
        }
    }
}

fn ceil_minutes(d: Duration) -> u32 {
    let secs = d.num_seconds().max(0);
    let minutes = (secs + 59) / 60;
    minutes.max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn fresh_log_allows_full_budget() {
        let mut log = AttemptLog::new();
        let s = log.status(&LockoutPolicy::default(), t0());
        assert!(s.allowed);
        assert_eq!(s.remaining_attempts, 5);
        assert_eq!(s.lockout_minutes, None);
    }

    #[test]
    fn five_failures_lock_and_report_minutes() {
        let policy = LockoutPolicy::default();
        let mut log = AttemptLog::new();
        for i in 0..5 {
            assert!(log.status(&policy, t0() + Duration::minutes(i)).allowed);
            log.record(false, t0() + Duration::minutes(i));
        }
        let s = log.status(&policy, t0() + Duration::minutes(5));
        assert!(!s.allowed);
        assert_eq!(s.remaining_attempts, 0);
        // oldest failure at t0, window 15m, now t0+5m
        assert_eq!(s.lockout_minutes, Some(10));
    }

    #[test]
    fn window_elapse_unlocks() {
        let policy = LockoutPolicy::default();
        let mut log = AttemptLog::new();
        for _ in 0..5 {
            log.record(false, t0());
        }
        assert!(!log.status(&policy, t0() + Duration::minutes(14)).allowed);
        let later = log.status(&policy, t0() + Duration::minutes(15));
        assert!(later.allowed);
        assert_eq!(later.remaining_attempts, 5);
        assert!(log.attempts.is_empty());
    }

    #[test]
    fn successes_do_not_consume_the_budget() {
        let policy = LockoutPolicy::default();
        let mut log = AttemptLog::new();
        log.record(true, t0());
        log.record(false, t0());
        log.record(true, t0());
        let s = log.status(&policy, t0());
        assert_eq!(s.remaining_attempts, 4);
        assert_eq!(log.attempts.len(), 3);
    }

    #[test]
    fn partial_minutes_round_up() {
        let policy = LockoutPolicy::default();
        let mut log = AttemptLog::new();
        for _ in 0..5 {
            log.record(false, t0());
        }
        let s = log.status(&policy, t0() + Duration::seconds(14 * 60 + 30));
        assert_eq!(s.lockout_minutes, Some(1));
    }
}
