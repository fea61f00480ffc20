use metrics::{
    log_counter,
    log_gauge,
    register_counter,
    register_gauge,
};

register_gauge!(
    DISPATCHER_QUEUE_DEPTH_RECORDS,
    "current_number_of_records_buffered_in_the_dispatcher_queue_records"
);
register_counter!(
    DISPATCHER_RECORDS_ACCEPTED_TOTAL,
    "records_accepted_by_dispatcher_handle_total"
);
register_counter!(
    DISPATCHER_RECORDS_DROPPED_TOTAL,
    "records_dropped_because_the_dispatcher_queue_was_full_total"
);
register_counter!(
    DISPATCHER_FANOUT_ERRORS_TOTAL,
    "sink_send_calls_that_returned_an_error_during_fanout_total"
);

pub fn record_accepted() {
    log_counter(&DISPATCHER_RECORDS_ACCEPTED_TOTAL, 1);
}

pub fn record_dropped(n: u64) {
    log_counter(&DISPATCHER_RECORDS_DROPPED_TOTAL, n);
}

pub fn record_fanout_error() {
    log_counter(&DISPATCHER_FANOUT_ERRORS_TOTAL, 1);
}

pub fn set_queue_depth(depth: usize) {
    log_gauge(&DISPATCHER_QUEUE_DEPTH_RECORDS, depth as f64);
}
