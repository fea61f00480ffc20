use prometheus::{
    core::Collector,
    Gauge,
    GaugeVec,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
};

use crate::{
    labels::StaticMetricLabel,
    log_invalid_metric,
};

pub fn log_counter(prometheus_counter: &IntCounter, increment: u64) {
    prometheus_counter.inc_by(increment);
}

pub fn log_counter_with_labels(
    prometheus_counter: &IntCounterVec,
    increment: u64,
    labels: Vec<StaticMetricLabel>,
) {
    match prometheus_counter.get_metric_with(&labels.iter().map(StaticMetricLabel::split_key_value).collect())
    {
        Ok(metric) => metric.inc_by(increment),
        Err(e) => log_invalid_metric(get_desc(prometheus_counter), e),
    }
}

pub fn log_gauge(prometheus_gauge: &Gauge, value: f64) {
    prometheus_gauge.set(value);
}

pub fn log_gauge_with_labels(prometheus_gauge: &GaugeVec, value: f64, labels: Vec<StaticMetricLabel>) {
    match prometheus_gauge.get_metric_with(&labels.iter().map(StaticMetricLabel::split_key_value).collect())
    {
        Ok(metric) => metric.set(value),
        Err(e) => log_invalid_metric(get_desc(prometheus_gauge), e),
    }
}

pub fn log_distribution(prometheus_histogram: &Histogram, value: f64) {
    prometheus_histogram.observe(value);
}

pub fn log_distribution_with_labels(
    prometheus_histogram: &HistogramVec,
    value: f64,
    labels: Vec<StaticMetricLabel>,
) {
    match prometheus_histogram
        .get_metric_with(&labels.iter().map(StaticMetricLabel::split_key_value).collect())
    {
        Ok(metric) => metric.observe(value),
        Err(e) => log_invalid_metric(get_desc(prometheus_histogram), e),
    }
}

pub fn get_desc<M: Collector>(metric: &M) -> String {
    metric
        .desc()
        .first()
        .map(|d| d.fq_name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
