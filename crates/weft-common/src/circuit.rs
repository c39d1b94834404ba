// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Circuit breaker for outbound destinations.
//!
//! Closed: calls flow, consecutive failures are counted against a trip
//! threshold within a rolling interval. Open: calls are rejected until the
//! open timeout elapses. Half-open: up to `max_requests` probe calls are
//! admitted; any failure reopens, enough successes close.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strum::Display;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A bounded number of probe calls are admitted.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSettings {
    /// Probe calls admitted while half-open.
    pub max_requests: u32,
    /// Rolling interval after which closed-state counters reset.
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Consecutive failures that trip the breaker.
    pub trip_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            trip_threshold: 5,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_in_flight: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    window_start: Instant,
}

/// A permit returned by [`CircuitBreaker::try_acquire`]. Report the call
/// outcome through it.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
}

impl CircuitPermit<'_> {
    /// Record a successful call.
    pub fn record_success(self) {
        self.breaker.on_success();
    }

    /// Record a failed call.
    pub fn record_failure(self) {
        self.breaker.on_failure();
    }
}

/// A permit that owns its breaker reference, for callers that need to carry
/// the permit across await points or into other structs.
#[derive(Debug)]
pub struct OwnedCircuitPermit {
    breaker: std::sync::Arc<CircuitBreaker>,
}

impl OwnedCircuitPermit {
    /// Record a successful call.
    pub fn record_success(self) {
        self.breaker.on_success();
    }

    /// Record a failed call.
    pub fn record_failure(self) {
        self.breaker.on_failure();
    }
}

/// Per-destination circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_in_flight: 0,
                half_open_successes: 0,
                opened_at: None,
                window_start: Instant::now(),
            }),
        }
    }

    /// Current state, advancing open→half-open when the timeout elapsed.
    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock();
        self.advance(&mut guard, Instant::now());
        guard.state
    }

    fn advance(&self, s: &mut BreakerState, now: Instant) {
        match s.state {
            CircuitState::Open => {
                if let Some(opened) = s.opened_at {
                    if now.duration_since(opened) >= self.settings.timeout {
                        s.state = CircuitState::HalfOpen;
                        s.half_open_in_flight = 0;
                        s.half_open_successes = 0;
                    }
                }
            }
            CircuitState::Closed => {
                if now.duration_since(s.window_start) >= self.settings.interval {
                    s.consecutive_failures = 0;
                    s.window_start = now;
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    /// Try to admit a call, returning a permit that owns its breaker
    /// reference. Call on a clone of the shared breaker handle.
    pub fn try_acquire_owned(self: std::sync::Arc<Self>) -> Option<OwnedCircuitPermit> {
        let mut guard = self.state.lock();
        self.advance(&mut guard, Instant::now());
        match guard.state {
            CircuitState::Closed => Some(OwnedCircuitPermit {
                breaker: self.clone(),
            }),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if guard.half_open_in_flight < self.settings.max_requests {
                    guard.half_open_in_flight += 1;
                    Some(OwnedCircuitPermit {
                        breaker: self.clone(),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Try to admit a call.
    pub fn try_acquire(&self) -> Option<CircuitPermit<'_>> {
        let mut guard = self.state.lock();
        self.advance(&mut guard, Instant::now());
        match guard.state {
            CircuitState::Closed => Some(CircuitPermit { breaker: self }),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if guard.half_open_in_flight < self.settings.max_requests {
                    guard.half_open_in_flight += 1;
                    Some(CircuitPermit { breaker: self })
                } else {
                    None
                }
            }
        }
    }

    fn on_success(&self) {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                guard.half_open_in_flight = guard.half_open_in_flight.saturating_sub(1);
                guard.half_open_successes += 1;
                if guard.half_open_successes >= self.settings.max_requests {
                    guard.state = CircuitState::Closed;
                    guard.consecutive_failures = 0;
                    guard.opened_at = None;
                    guard.window_start = Instant::now();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut guard = self.state.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.settings.trip_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                guard.half_open_in_flight = guard.half_open_in_flight.saturating_sub(1);
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            max_requests: 2,
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(10),
            trip_threshold: 3,
        }
    }

    #[test]
    fn trips_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            breaker.try_acquire().unwrap().record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(fast_settings());
        breaker.try_acquire().unwrap().record_failure();
        breaker.try_acquire().unwrap().record_failure();
        breaker.try_acquire().unwrap().record_success();
        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_then_close() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            breaker.try_acquire().unwrap().record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.try_acquire().unwrap().record_success();
        breaker.try_acquire().unwrap().record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            breaker.try_acquire().unwrap().record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        breaker.try_acquire().unwrap().record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_bounds_in_flight_probes() {
        let breaker = CircuitBreaker::new(fast_settings());
        for _ in 0..3 {
            breaker.try_acquire().unwrap().record_failure();
        }
        std::thread::sleep(Duration::from_millis(15));
        let p1 = breaker.try_acquire().unwrap();
        let _p2 = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none());
        p1.record_success();
    }
}
