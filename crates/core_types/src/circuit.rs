use std::time::{
    Duration,
    Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Per-sink circuit breaker state. `closed` sends normally; `open`
/// short-circuits sends straight to the DLQ (or holds them, per config)
/// until `opened_at + open_duration` elapses, at which point exactly one
/// probe is allowed through by moving to `half-open`. Each failed probe
/// doubles the cool-down for the next attempt, up to `max_open_duration`,
/// the same doubling-with-a-cap shape as `runtime::Backoff`.
#[derive(Debug, Clone, Copy)]
pub struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    half_open_failures: u32,
    opened_at: Option<Instant>,
    open_duration: Duration,
    probe_permit: bool,
}

impl CircuitState {
    pub fn closed() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            half_open_failures: 0,
            opened_at: None,
            open_duration: Duration::ZERO,
            probe_permit: false,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a failed send. Returns `true` if this call tripped the
    /// breaker open.
    pub fn record_failure(&mut self, failure_threshold: u32, base_open_duration: Duration, max_open_duration: Duration, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.status == CircuitStatus::Closed && self.consecutive_failures >= failure_threshold {
            self.status = CircuitStatus::Open;
            self.opened_at = Some(now);
            self.open_duration = base_open_duration;
            self.half_open_failures = 0;
            return true;
        }
        if self.status == CircuitStatus::HalfOpen {
            // The probe failed: stay open and wait out a longer cool-down.
            self.half_open_failures += 1;
            let scale = 2u32.checked_pow(self.half_open_failures).unwrap_or(u32::MAX);
            self.open_duration = base_open_duration.checked_mul(scale).unwrap_or(max_open_duration).min(max_open_duration);
            self.status = CircuitStatus::Open;
            self.opened_at = Some(now);
        }
        false
    }

    pub fn record_success(&mut self) {
        self.status = CircuitStatus::Closed;
        self.consecutive_failures = 0;
        self.half_open_failures = 0;
        self.opened_at = None;
        self.open_duration = Duration::ZERO;
        self.probe_permit = false;
    }

    /// Whether a caller may attempt a send right now, transitioning
    /// `open -> half-open` and consuming the single probe permit if the
    /// cool-down has elapsed.
    pub fn allow_request(&mut self, now: Instant) -> bool {
        match self.status {
            CircuitStatus::Closed => true,
            CircuitStatus::HalfOpen => {
                if self.probe_permit {
                    self.probe_permit = false;
                    true
                } else {
                    false
                }
            },
            CircuitStatus::Open => {
                let opened_at = self.opened_at.expect("open state always has opened_at");
                if now.saturating_duration_since(opened_at) >= self.open_duration {
                    self.status = CircuitStatus::HalfOpen;
                    self.probe_permit = true;
                    true
                } else {
                    false
                }
            },
        }
    }
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_open_after_threshold_failures() {
        let mut circuit = CircuitState::closed();
        let now = Instant::now();
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        assert!(!circuit.record_failure(3, base, max, now));
        assert!(!circuit.record_failure(3, base, max, now));
        assert!(circuit.record_failure(3, base, max, now));
        assert_eq!(circuit.status(), CircuitStatus::Open);
    }

    #[test]
    fn half_open_probe_is_single_use() {
        let mut circuit = CircuitState::closed();
        let start = Instant::now();
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        circuit.record_failure(1, base, max, start);
        assert_eq!(circuit.status(), CircuitStatus::Open);

        assert!(!circuit.allow_request(start));
        let later = start + Duration::from_secs(31);
        assert!(circuit.allow_request(later));
        assert_eq!(circuit.status(), CircuitStatus::HalfOpen);
        // Permit consumed; a second concurrent caller is denied until the
        // probe resolves.
        assert!(!circuit.allow_request(later));
    }

    #[test]
    fn repeated_half_open_failures_extend_the_cool_down() {
        let mut circuit = CircuitState::closed();
        let start = Instant::now();
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        circuit.record_failure(1, base, max, start);

        let first_retry = start + Duration::from_secs(31);
        assert!(circuit.allow_request(first_retry));
        assert_eq!(circuit.status(), CircuitStatus::HalfOpen);

        // The probe itself fails: cool-down should now be longer than the base.
        circuit.record_failure(1, base, max, first_retry);
        assert_eq!(circuit.status(), CircuitStatus::Open);
        assert!(!circuit.allow_request(first_retry + base));
        let second_retry = first_retry + Duration::from_secs(61);
        assert!(circuit.allow_request(second_retry));

        // A second consecutive probe failure should extend it again, still bounded by max.
        circuit.record_failure(1, base, max, second_retry);
        assert!(!circuit.allow_request(second_retry + Duration::from_secs(121)));
    }

    #[test]
    fn success_resets_to_closed() {
        let mut circuit = CircuitState::closed();
        let now = Instant::now();
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(600);
        circuit.record_failure(1, base, max, now);
        circuit.record_success();
        assert_eq!(circuit.status(), CircuitStatus::Closed);
        assert_eq!(circuit.consecutive_failures(), 0);
    }
}
