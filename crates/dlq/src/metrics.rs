use metrics::{
    log_counter_with_labels,
    log_gauge_with_labels,
    register_counter,
    register_gauge,
    StaticMetricLabel,
};

register_counter!(
    DLQ_ENTRIES_WRITTEN_TOTAL,
    "records_appended_to_a_sinks_dead_letter_queue_total",
    &["sink"]
);
register_counter!(
    DLQ_ENTRIES_REPROCESSED_TOTAL,
    "dead_letter_entries_successfully_redelivered_total",
    &["sink"]
);
register_counter!(
    DLQ_ENTRIES_EVICTED_TOTAL,
    "dead_letter_entries_dropped_by_retention_total",
    &["sink"]
);
register_gauge!(
    DLQ_DEPTH_RECORDS,
    "entries_currently_held_in_a_sinks_dead_letter_queue_records",
    &["sink"]
);

pub fn entry_written(sink: &str) {
    log_counter_with_labels(&DLQ_ENTRIES_WRITTEN_TOTAL, 1, vec![StaticMetricLabel::new("sink", sink.to_string())]);
}

pub fn entry_reprocessed(sink: &str) {
    log_counter_with_labels(
        &DLQ_ENTRIES_REPROCESSED_TOTAL,
        1,
        vec![StaticMetricLabel::new("sink", sink.to_string())],
    );
}

pub fn entries_evicted(sink: &str, n: u64) {
    log_counter_with_labels(&DLQ_ENTRIES_EVICTED_TOTAL, n, vec![StaticMetricLabel::new("sink", sink.to_string())]);
}

pub fn set_depth(sink: &str, depth: u64) {
    log_gauge_with_labels(&DLQ_DEPTH_RECORDS, depth as f64, vec![StaticMetricLabel::new("sink", sink.to_string())]);
}
