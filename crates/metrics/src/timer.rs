use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use crate::{
    get_desc,
    labels::StaticMetricLabel,
    log_distribution_with_labels,
};

/// RAII timer against a labeled histogram that defaults to `status=error`
/// unless [`StatusTimer::finish`] is called explicitly. Drop without
/// finishing (e.g. an early `?` return) and the observation is recorded as a
/// failure, so latency histograms don't silently exclude the error path.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static prometheus::HistogramVec,
    labels: BTreeSet<StaticMetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static prometheus::HistogramVec) -> Self {
        let mut labels = BTreeSet::new();
        labels.insert(StaticMetricLabel::STATUS_ERROR);
        Self {
            start: Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.insert(label);
    }

    fn replace_status(&mut self, new_status: StaticMetricLabel) {
        self.labels.remove(&StaticMetricLabel::STATUS_ERROR);
        self.labels.remove(&StaticMetricLabel::STATUS_SUCCESS);
        self.labels.remove(&StaticMetricLabel::STATUS_CANCELED);
        self.labels.insert(new_status);
    }

    pub fn finish(mut self) -> Duration {
        self.replace_status(StaticMetricLabel::STATUS_SUCCESS);
        self.elapsed()
    }

    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.replace_status(StaticMetricLabel::new("status", status));
        self.elapsed()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed().as_secs_f64();
        let desc = get_desc(self.histogram);
        tracing::debug!(elapsed, metric = %desc, "timer finished");
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(self.histogram, elapsed, labels.into_iter().collect());
    }
}
