use metrics::{
    log_counter_with_labels,
    log_gauge,
    log_gauge_with_labels,
    register_counter,
    register_gauge,
    StaticMetricLabel,
};

register_counter!(
    SOURCE_RECORDS_READ_TOTAL,
    "records_read_from_a_source_before_dispatch_total",
    &["source_kind"]
);
register_counter!(
    SOURCE_RECORDS_RETRIED_TOTAL,
    "records_a_source_held_in_its_local_retry_queue_because_the_dispatcher_was_full_total",
    &["source_kind"]
);
register_counter!(
    SOURCE_RECORDS_DROPPED_TOTAL,
    "records_a_source_dropped_from_its_local_retry_queue_total",
    &["source_kind"]
);
register_gauge!(FILE_MONITOR_FILES_TRACKED, "number_of_files_currently_tailed_by_the_file_monitor");
register_gauge!(CONTAINER_MONITOR_CONTAINERS_TRACKED, "number_of_containers_currently_tailed_by_the_container_monitor");
register_gauge!(
    CONTAINER_MONITOR_SELF_EXCLUDED,
    "number_of_containers_currently_throttled_by_the_self_monitor_circuit_breaker"
);

fn label(source_kind: &str) -> Vec<StaticMetricLabel> {
    vec![StaticMetricLabel::new("source_kind", source_kind.to_string())]
}

pub fn record_read(source_kind: &str) {
    log_counter_with_labels(&SOURCE_RECORDS_READ_TOTAL, 1, label(source_kind));
}

pub fn record_retried(source_kind: &str) {
    log_counter_with_labels(&SOURCE_RECORDS_RETRIED_TOTAL, 1, label(source_kind));
}

pub fn record_dropped(source_kind: &str) {
    log_counter_with_labels(&SOURCE_RECORDS_DROPPED_TOTAL, 1, label(source_kind));
}

pub fn set_files_tracked(n: usize) {
    log_gauge(&FILE_MONITOR_FILES_TRACKED, n as f64);
}

pub fn set_containers_tracked(n: usize) {
    log_gauge(&CONTAINER_MONITOR_CONTAINERS_TRACKED, n as f64);
}

pub fn set_self_excluded(n: usize) {
    log_gauge(&CONTAINER_MONITOR_SELF_EXCLUDED, n as f64);
}
