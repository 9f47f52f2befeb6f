//! # Circuit Breaker
//!
//! Protects an unreachable primary from being hammered by scheduled syncs.
//!
//! ```text
//!            failure_count < threshold
//!   ┌────────┐ ───────────────────────────► attempt runs
//!   │ Closed │
//!   └────────┘
//!        │ failure_count >= threshold
//!        ▼
//!   ┌────────┐  now - last_failure < cooldown
//!   │  Open  │ ───────────────────────────► skip (no network, no tracker write)
//!   └────────┘
//!        │ cooldown elapsed
//!        ▼
//!   ┌──────────┐  counters cleared,
//!   │ HalfOpen │  one attempt allowed; a failure starts counting from 1
//!   └──────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Failure bookkeeping for one remote.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Read-only view for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    #[ts(as = "Option<String>")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        CircuitBreaker::new(
            DEFAULT_FAILURE_THRESHOLD,
            Duration::seconds(DEFAULT_COOLDOWN_SECS),
        )
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold: threshold.max(1),
            cooldown,
            failure_count: 0,
            last_failure_at: None,
        }
    }

    /// Gate for an attempt at `now`.
    ///
    /// Clears the counters when the cool-down has elapsed, so the caller
    /// sees `HalfOpen` exactly once per trip.
    pub fn check(&mut self, now: DateTime<Utc>) -> CircuitState {
        if self.failure_count < self.threshold {
            return CircuitState::Closed;
        }

        match self.last_failure_at {
            Some(last) if now - last < self.cooldown => CircuitState::Open,
            _ => {
                self.reset();
                CircuitState::HalfOpen
            }
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
    }

    pub fn record_success(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.failure_count = 0;
        self.last_failure_at = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Current state without side effects.
    pub fn snapshot(&self, now: DateTime<Utc>) -> BreakerSnapshot {
        let state = if self.failure_count < self.threshold {
            CircuitState::Closed
        } else if self
            .last_failure_at
            .is_some_and(|last| now - last < self.cooldown)
        {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        };

        BreakerSnapshot {
            state,
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 23, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::default();

        for i in 0..4 {
            breaker.record_failure(t0() + Duration::seconds(i));
            assert_eq!(breaker.check(t0() + Duration::seconds(i)), CircuitState::Closed);
        }

        breaker.record_failure(t0() + Duration::seconds(4));
        assert_eq!(breaker.check(t0() + Duration::seconds(5)), CircuitState::Open);
        assert_eq!(breaker.snapshot(t0()).failure_count, 5);
    }

    #[test]
    fn test_half_open_after_cooldown_clears_state() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..5 {
            breaker.record_failure(t0());
        }

        let almost = t0() + Duration::seconds(299);
        assert_eq!(breaker.check(almost), CircuitState::Open);

        let after = t0() + Duration::minutes(5);
        assert_eq!(breaker.snapshot(after).state, CircuitState::HalfOpen);
        assert_eq!(breaker.check(after), CircuitState::HalfOpen);
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.check(after), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets() {
        let mut breaker = CircuitBreaker::new(2, Duration::minutes(1));
        breaker.record_failure(t0());
        breaker.record_success();
        breaker.record_failure(t0());

        assert_eq!(breaker.check(t0()), CircuitState::Closed);
    }

    #[test]
    fn test_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
