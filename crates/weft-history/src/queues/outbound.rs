// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound destination gate.
//!
//! Outbound tasks call external destinations (callbacks, service endpoints).
//! Every destination gets its own token bucket and circuit breaker; a task
//! must clear both before its executor may issue the call, and must report
//! the call outcome so the breaker can trip on failing destinations.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use weft_common::circuit::{CircuitBreaker, CircuitBreakerSettings, CircuitState, OwnedCircuitPermit};
use weft_common::ratelimit::TokenBucket;

/// Why a call was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundDenied {
    /// The destination's token bucket is empty; retry after the wait.
    RateLimited,
    /// The destination's circuit is open or saturated with probes.
    CircuitOpen,
}

/// Per-destination limits.
#[derive(Debug, Clone)]
pub struct DestinationSettings {
    /// Admitted calls per second.
    pub rate_per_second: f64,
    /// Burst capacity.
    pub burst: f64,
    /// Breaker tuning.
    pub circuit: CircuitBreakerSettings,
}

impl Default for DestinationSettings {
    fn default() -> Self {
        Self {
            rate_per_second: 100.0,
            burst: 200.0,
            circuit: CircuitBreakerSettings::default(),
        }
    }
}

struct DestinationState {
    bucket: TokenBucket,
    breaker: Arc<CircuitBreaker>,
}

/// An admitted outbound call. Report its outcome exactly once.
#[derive(Debug)]
pub struct AdmittedCall {
    permit: OwnedCircuitPermit,
}

impl AdmittedCall {
    /// Record a successful call.
    pub fn record_success(self) {
        self.permit.record_success();
    }

    /// Record a failed call.
    pub fn record_failure(self) {
        self.permit.record_failure();
    }
}

/// The per-destination gate.
pub struct OutboundGate {
    settings: DestinationSettings,
    destinations: Mutex<HashMap<String, Arc<DestinationState>>>,
}

impl OutboundGate {
    /// Create a gate applying `settings` to every destination.
    pub fn new(settings: DestinationSettings) -> Self {
        Self {
            settings,
            destinations: Mutex::new(HashMap::new()),
        }
    }

    fn destination(&self, destination: &str) -> Arc<DestinationState> {
        self.destinations
            .lock()
            .entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(DestinationState {
                    bucket: TokenBucket::new(self.settings.rate_per_second, self.settings.burst),
                    breaker: Arc::new(CircuitBreaker::new(self.settings.circuit.clone())),
                })
            })
            .clone()
    }

    /// Try to admit one call to `destination`.
    pub fn try_admit(&self, destination: &str) -> Result<AdmittedCall, OutboundDenied> {
        let state = self.destination(destination);
        // bucket first: a breaker permit taken and dropped would count as an
        // in-flight half-open probe
        if !state.bucket.try_acquire() {
            return Err(OutboundDenied::RateLimited);
        }
        let Some(permit) = state.breaker.clone().try_acquire_owned() else {
            return Err(OutboundDenied::CircuitOpen);
        };
        Ok(AdmittedCall { permit })
    }

    /// Breaker state of a destination, for observability.
    pub fn circuit_state(&self, destination: &str) -> CircuitState {
        self.destination(destination).breaker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(rate: f64, burst: f64, trip: u32) -> OutboundGate {
        OutboundGate::new(DestinationSettings {
            rate_per_second: rate,
            burst,
            circuit: CircuitBreakerSettings {
                max_requests: 1,
                interval: Duration::from_secs(60),
                timeout: Duration::from_millis(20),
                trip_threshold: trip,
            },
        })
    }

    #[test]
    fn rate_limit_denies_past_burst() {
        let gate = gate(1.0, 2.0, 100);
        assert!(gate.try_admit("https://a").is_ok());
        assert!(gate.try_admit("https://a").is_ok());
        assert_eq!(
            gate.try_admit("https://a").unwrap_err(),
            OutboundDenied::RateLimited
        );
        // another destination has its own bucket
        assert!(gate.try_admit("https://b").is_ok());
    }

    #[test]
    fn failures_trip_the_destination_circuit() {
        let gate = gate(1000.0, 1000.0, 3);
        for _ in 0..3 {
            gate.try_admit("https://bad").unwrap().record_failure();
        }
        assert_eq!(
            gate.try_admit("https://bad").unwrap_err(),
            OutboundDenied::CircuitOpen
        );
        // an unrelated destination is unaffected
        assert!(gate.try_admit("https://good").is_ok());
    }

    #[test]
    fn circuit_recovers_after_timeout() {
        let gate = gate(1000.0, 1000.0, 2);
        gate.try_admit("https://flaky").unwrap().record_failure();
        gate.try_admit("https://flaky").unwrap().record_failure();
        assert!(gate.try_admit("https://flaky").is_err());

        std::thread::sleep(Duration::from_millis(30));
        // half-open admits one probe and saturates until it reports back
        let probe = gate.try_admit("https://flaky").unwrap();
        assert_eq!(
            gate.try_admit("https://flaky").unwrap_err(),
            OutboundDenied::CircuitOpen
        );
        probe.record_success();
        assert_eq!(gate.circuit_state("https://flaky"), CircuitState::Closed);
    }
}
