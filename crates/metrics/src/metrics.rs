//! Common functions for metrics logging.
//!
//! We follow [Prometheus's naming conventions](https://prometheus.io/docs/practices/naming/):
//!
//! 1. Metrics may only contain alphanumerics and underscores.
//! 2. Metrics are automatically prefixed with [`crate::METRIC_PREFIX`].
//! 3. Suffix metrics with their units (e.g. `_seconds`, `_bytes`, `_total`) --
//!    see `ALLOWED_SUFFIXES`.
//!
//! All metrics code for a component goes in that component's own `metrics`
//! module; the interface it exposes should be high level ("this event
//! happened") rather than a raw `f64` logged against a metric name.
use std::{
    borrow::Cow,
    collections::HashSet,
    ops::Deref,
    sync::LazyLock,
};

use parking_lot::RwLock;

use crate::{
    log_counter_with_labels,
    register_counter,
    StaticMetricLabel,
};

const ALLOWED_SUFFIXES: &[&str] = &[
    "_seconds",
    "_bytes",
    "_connections",
    "_requests",
    "_timeouts",
    "_records",
    "_batches",
    "_errors",
    "_reads",
    "_writes",
    "_retries",
    "_total",
    "_info",
];

/// Identifies this process in metric labels. Derived from the binary name
/// unless overridden.
pub static SERVICE_NAME: LazyLock<String> = LazyLock::new(|| {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "agent".to_string())
        .replace('-', "_")
});

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetricName(Cow<'static, str>);

impl MetricName {
    pub const fn new(name: &'static str) -> Self {
        validate_metric_name(name);
        Self(Cow::Borrowed(name))
    }
}

impl Deref for MetricName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0[..]
    }
}

const fn ends_with(s: &[u8], suffix: &[u8]) -> bool {
    if s.len() < suffix.len() {
        return false;
    }
    let s_base = s.len() - suffix.len();
    let mut i = 0;
    while i < suffix.len() {
        if s[s_base + i] != suffix[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn validate_metric_name(name: &str) {
    let name_bytes = name.as_bytes();

    let mut i = 0;
    while i < name_bytes.len() {
        let c = name_bytes[i];
        let is_upper = c >= 65 && c <= 90;
        let is_lower = c >= 97 && c <= 122;
        let is_numeric = c >= 48 && c <= 57;
        let is_underscore = c == 95;
        if !(is_upper || is_lower || is_numeric || is_underscore) {
            panic!("metric names can only contain alphanumeric characters and underscores");
        }
        i += 1;
    }

    let mut i = 0;
    let mut found_suffix = false;
    while i < ALLOWED_SUFFIXES.len() {
        if ends_with(name_bytes, ALLOWED_SUFFIXES[i].as_bytes()) {
            found_suffix = true;
            break;
        }
        i += 1;
    }
    if !found_suffix {
        panic!(
            "metric names must end with their units as a suffix (e.g. `_seconds`, `_bytes`, \
             `_total`)"
        );
    }
}

/// Forces metric name validation to happen at compile time.
#[macro_export]
macro_rules! metric_name {
    ($name: expr) => {{
        use $crate::MetricName;
        const METRIC_NAME: MetricName = MetricName::new($name);
        format!("{}_{}", $crate::METRIC_PREFIX, *METRIC_NAME)
    }};
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricHelp(&'static str);

impl MetricHelp {
    pub const fn new(help_str: &'static str) -> Self {
        if help_str.is_empty() {
            panic!("metric help strings must be nonempty");
        }
        Self(help_str)
    }
}

impl Deref for MetricHelp {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[macro_export]
macro_rules! metric_help {
    ($help: literal) => {{
        use $crate::MetricHelp;
        const METRIC_HELP: MetricHelp = MetricHelp::new($help);
        METRIC_HELP
    }};
}

register_counter!(
    INVALID_METRIC_TOTAL,
    "count_of_metrics_that_failed_to_report_total",
    &["metric_name"]
);

static METRICS_ERROR_ONCE: LazyLock<RwLock<HashSet<String>>> = LazyLock::new(Default::default);

/// Called when a labeled metric lookup fails (e.g. bad label cardinality).
/// Logs once per distinct metric name so a bad call site doesn't spam logs
/// under load.
pub fn log_invalid_metric(name: String, error: prometheus::Error) {
    log_counter_with_labels(
        &INVALID_METRIC_TOTAL,
        1,
        vec![StaticMetricLabel::new("metric_name", name.clone())],
    );
    if METRICS_ERROR_ONCE.read().contains(&name) {
        return;
    }
    if METRICS_ERROR_ONCE.write().insert(name.clone()) {
        tracing::error!(metric_name = %name, %error, "failed to record metric");
    }
}
