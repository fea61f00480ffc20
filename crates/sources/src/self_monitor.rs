use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;

/// Defends against a feedback loop where the agent captures its own log
/// output: counts records per container over a rolling window and
/// auto-excludes any single container responsible for an outsized share of
/// everything emitted recently.
pub struct SelfMonitor {
    window: Duration,
    threshold: f64,
    min_sample: u64,
    counts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SelfMonitor {
    pub fn new(window: Duration, threshold: f64) -> Self {
        Self {
            window,
            threshold,
            min_sample: 100,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_emitted(&self, container_id: &str) {
        let mut counts = self.counts.lock();
        let now = Instant::now();
        let entry = counts.entry(container_id.to_string()).or_default();
        entry.push(now);
        let cutoff = now - self.window * 2;
        entry.retain(|t| *t >= cutoff);
    }

    /// True if `container_id` has contributed `>= threshold` of all records
    /// emitted across every container within the last window, with at
    /// least `min_sample` total records observed (otherwise there isn't
    /// enough signal to judge). Also recomputes and reports the
    /// currently-excluded gauge across every tracked container, since this
    /// is the one place that already walks the full per-container
    /// breakdown for the window.
    pub fn is_excluded(&self, container_id: &str) -> bool {
        let counts = self.counts.lock();
        let now = Instant::now();
        let cutoff = now - self.window;
        let recent_per_container: Vec<(&String, u64)> =
            counts.iter().map(|(id, timestamps)| (id, timestamps.iter().filter(|t| **t >= cutoff).count() as u64)).collect();
        let total: u64 = recent_per_container.iter().map(|(_, n)| n).sum();

        if total < self.min_sample {
            crate::metrics::set_self_excluded(0);
            return false;
        }

        let excluded_count = recent_per_container.iter().filter(|(_, n)| (*n as f64 / total as f64) >= self.threshold).count();
        crate::metrics::set_self_excluded(excluded_count);

        recent_per_container
            .into_iter()
            .find(|(id, _)| *id == container_id)
            .is_some_and(|(_, n)| (n as f64 / total as f64) >= self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_a_container_that_dominates_the_window() {
        let monitor = SelfMonitor::new(Duration::from_secs(60), 0.9);
        for _ in 0..150 {
            monitor.record_emitted("noisy");
        }
        for _ in 0..5 {
            monitor.record_emitted("quiet");
        }
        assert!(monitor.is_excluded("noisy"));
        assert!(!monitor.is_excluded("quiet"));
    }

    #[test]
    fn does_not_exclude_below_the_minimum_sample() {
        let monitor = SelfMonitor::new(Duration::from_secs(60), 0.9);
        for _ in 0..10 {
            monitor.record_emitted("noisy");
        }
        assert!(!monitor.is_excluded("noisy"));
    }
}
