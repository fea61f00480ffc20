use crate::ErrorMetadataAnyhowExt;

/// Log an unexpected error at the appropriate level, yielding first so that a
/// shutdown-in-progress cancellation has a chance to preempt us.
///
/// This is the single place non-expected errors get surfaced from deep call
/// sites (sink send loops, monitor reconnect loops, the DLQ reprocessor).
/// Expected conditions -- back-pressure, cancellation, a sink returning a
/// permanent rejection -- are handled locally and should not be routed
/// through here.
pub async fn report_error(err: &mut anyhow::Error) {
    trace_error(err);
    tokio::task::yield_now().await;
}

/// Synchronous counterpart of [`report_error`] for use outside an async
/// context (e.g. inside a `Drop` impl or a panic hook).
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
}

fn trace_error(err: &anyhow::Error) {
    let short_msg = err.short_msg().unwrap_or("Unclassified");
    if err.is_permanent() {
        tracing::warn!(short_msg, "{err:#}");
    } else {
        tracing::error!(short_msg, "{err:#}");
    }
    tracing::debug!("{err:?}");
}
