use std::time::Instant;

use config::schema::CircuitConfig;
use core_types::{
    CircuitState,
    CircuitStatus,
};
use parking_lot::Mutex;

use crate::metrics;

/// Thread-safe wrapper around [`CircuitState`] for one sink, plus the
/// adaptive-batching rule: while half-open, the engine must cap the next
/// batch to a single record so the one allowed probe carries minimal blast
/// radius.
pub struct CircuitBreaker {
    sink_name: String,
    config: CircuitConfig,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(sink_name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            sink_name: sink_name.into(),
            config,
            state: Mutex::new(CircuitState::closed()),
        }
    }

    /// Whether the caller may attempt a send right now, consuming the
    /// single half-open probe permit if the cool-down elapsed.
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.lock();
        let allowed = state.allow_request(Instant::now());
        metrics::set_circuit_open(&self.sink_name, state.status() == CircuitStatus::Open);
        allowed
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.record_success();
        metrics::set_circuit_open(&self.sink_name, false);
    }

    /// Returns `true` if this failure just tripped the breaker open.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        let tripped = state.record_failure(self.config.failure_threshold, self.config.open_duration(), self.config.max_open_duration(), Instant::now());
        metrics::set_circuit_open(&self.sink_name, state.status() == CircuitStatus::Open);
        tripped
    }

    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status()
    }

    pub fn healthy(&self) -> bool {
        self.status() != CircuitStatus::Open
    }

    /// Batch-size cap to apply while assembling the next batch: 1 during
    /// `half-open`, unconstrained otherwise.
    pub fn max_batch_size(&self, configured_max: usize) -> usize {
        if self.status() == CircuitStatus::HalfOpen {
            1
        } else {
            configured_max
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_batch_size_to_one_while_half_open() {
        let breaker = CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: 1,
                open_duration_secs: 0,
                max_open_duration_secs: 0,
            },
        );
        assert_eq!(breaker.max_batch_size(500), 500);
        breaker.record_failure();
        assert_eq!(breaker.status(), CircuitStatus::Open);
        // Cool-down is zero, so the very next `allow_request` call flips to half-open.
        assert!(breaker.allow_request());
        assert_eq!(breaker.max_batch_size(500), 1);
    }
}
