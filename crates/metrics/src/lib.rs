//! Process-wide metrics registry and helpers.
//!
//! All metric names are automatically prefixed with `agent_` and registered
//! against a single process-wide [`prometheus::Registry`] so the admin HTTP
//! surface can export them with one `gather()` call. Components only see the
//! high-level `register_*!`/`log_*` surface in this crate; raw `prometheus`
//! types don't leak past it.
use prometheus::{
    Encoder,
    Registry,
    TextEncoder,
};

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::{
    labels::*,
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::StatusTimer,
};

/// Every metric name registered through the `register_*!` macros is prefixed
/// with this, e.g. `queue_depth` becomes `agent_queue_depth`.
pub const METRIC_PREFIX: &str = "agent";

/// The registry every `register_*!` macro invocation targets. Reach it only
/// through [`gather`] or the registration macros, never directly.
pub static AGENT_METRICS_REGISTRY: std::sync::LazyLock<Registry> =
    std::sync::LazyLock::new(Registry::new);

/// Render the current state of every registered metric in Prometheus text
/// exposition format, for the `/metrics` admin endpoint.
pub fn gather() -> anyhow::Result<String> {
    let metric_families = AGENT_METRICS_REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf)?;
    Ok(String::from_utf8(buf)?)
}
