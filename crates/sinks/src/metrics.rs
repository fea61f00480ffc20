use metrics::{
    log_counter_with_labels,
    log_distribution_with_labels,
    log_gauge_with_labels,
    register_counter,
    register_gauge,
    register_histogram,
    StaticMetricLabel,
};

register_counter!(
    SINK_BATCHES_SENT_TOTAL,
    "batches_successfully_delivered_by_a_sink_total",
    &["sink"]
);
register_counter!(
    SINK_BATCHES_FAILED_TOTAL,
    "batches_a_sink_gave_up_on_after_exhausting_retries_total",
    &["sink"]
);
register_counter!(
    SINK_RECORDS_SENT_TOTAL,
    "individual_records_successfully_delivered_by_a_sink_total",
    &["sink"]
);
register_counter!(
    SINK_RECORDS_DLQED_TOTAL,
    "records_handed_to_the_dead_letter_queue_by_a_sink_total",
    &["sink"]
);
register_counter!(
    SINK_RECORDS_DROPPED_TOTAL,
    "records_dropped_because_a_sinks_own_queue_was_full_total",
    &["sink"]
);
register_gauge!(
    SINK_CIRCUIT_OPEN,
    "whether_a_sinks_circuit_breaker_is_currently_open_1_or_0",
    &["sink"]
);
register_gauge!(
    SINK_QUEUE_DEPTH_RECORDS,
    "records_buffered_in_a_sinks_own_accumulator_queue",
    &["sink"]
);
register_histogram!(
    SINK_SEND_LATENCY_SECONDS,
    "wall_clock_time_spent_in_a_sinks_transport_send_call_seconds",
    &["sink"]
);

fn label(sink: &str) -> Vec<StaticMetricLabel> {
    vec![StaticMetricLabel::new("sink", sink.to_string())]
}

pub fn batch_sent(sink: &str) {
    log_counter_with_labels(&SINK_BATCHES_SENT_TOTAL, 1, label(sink));
}

pub fn batch_failed(sink: &str) {
    log_counter_with_labels(&SINK_BATCHES_FAILED_TOTAL, 1, label(sink));
}

pub fn records_sent(sink: &str, n: u64) {
    log_counter_with_labels(&SINK_RECORDS_SENT_TOTAL, n, label(sink));
}

pub fn records_dlqed(sink: &str, n: u64) {
    log_counter_with_labels(&SINK_RECORDS_DLQED_TOTAL, n, label(sink));
}

pub fn records_dropped(sink: &str, n: u64) {
    log_counter_with_labels(&SINK_RECORDS_DROPPED_TOTAL, n, label(sink));
}

pub fn set_circuit_open(sink: &str, open: bool) {
    log_gauge_with_labels(&SINK_CIRCUIT_OPEN, if open { 1.0 } else { 0.0 }, label(sink));
}

pub fn set_queue_depth(sink: &str, depth: usize) {
    log_gauge_with_labels(&SINK_QUEUE_DEPTH_RECORDS, depth as f64, label(sink));
}

pub fn record_send_latency(sink: &str, elapsed: std::time::Duration) {
    log_distribution_with_labels(&SINK_SEND_LATENCY_SECONDS, elapsed.as_secs_f64(), label(sink));
}
