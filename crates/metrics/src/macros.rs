pub use paste::paste;
pub use prometheus;

/// Register a histogram with the process metrics registry and store in a
/// static variable. An optional third argument specifies labels. The
/// reported metric name is the lower_snake_case form of the declared
/// variable name, prefixed with [`crate::METRIC_PREFIX`].
#[macro_export]
macro_rules! register_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| $crate::register_histogram_owned!($NAME, $HELP,));
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| $crate::register_histogram_owned!($NAME, $HELP, $LABELS,));
    };
}

#[macro_export]
macro_rules! register_histogram_owned {
    ($NAME:ident, $HELP:literal $(,)?) => {{
        $crate::paste! {
            let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
        }
        let help = $crate::metric_help!($HELP);
        $crate::prometheus::register_histogram_with_registry!(
            &*name,
            &*help,
            $crate::AGENT_METRICS_REGISTRY,
        )
        .expect("metric initialization failed")
    }};
    ($NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {{
        $crate::paste! {
            let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
        }
        let help = $crate::metric_help!($HELP);
        $crate::prometheus::register_histogram_vec_with_registry!(
            &*name,
            &*help,
            $LABELS,
            $crate::AGENT_METRICS_REGISTRY,
        )
        .expect("metric initialization failed")
    }};
}

/// Register an integer counter with the process metrics registry and store
/// in a static variable. An optional third argument specifies labels.
#[macro_export]
macro_rules! register_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| $crate::register_counter_owned!($NAME, $HELP,));
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| $crate::register_counter_owned!($NAME, $HELP, $LABELS,));
    };
}

#[macro_export]
macro_rules! register_counter_owned {
    ($NAME:ident, $HELP:literal $(,)?) => {{
        $crate::paste! {
            let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
        }
        let help = $crate::metric_help!($HELP);
        $crate::prometheus::register_int_counter_with_registry!(
            &*name,
            &*help,
            $crate::AGENT_METRICS_REGISTRY,
        )
        .expect("metric initialization failed")
    }};
    ($NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {{
        $crate::paste! {
            let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
        }
        let help = $crate::metric_help!($HELP);
        $crate::prometheus::register_int_counter_vec_with_registry!(
            &*name,
            &*help,
            $LABELS,
            $crate::AGENT_METRICS_REGISTRY,
        )
        .expect("metric initialization failed")
    }};
}

/// Register a floating-point gauge with the process metrics registry and
/// store in a static variable. An optional third argument specifies labels.
#[macro_export]
macro_rules! register_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| $crate::register_gauge_owned!($NAME, $HELP,));
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::GaugeVec> =
            std::sync::LazyLock::new(|| $crate::register_gauge_owned!($NAME, $HELP, $LABELS,));
    };
}

#[macro_export]
macro_rules! register_gauge_owned {
    ($NAME:ident, $HELP:literal $(,)?) => {{
        $crate::paste! {
            let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
        }
        let help = $crate::metric_help!($HELP);
        $crate::prometheus::register_gauge_with_registry!(
            &*name,
            &*help,
            $crate::AGENT_METRICS_REGISTRY,
        )
        .expect("metric initialization failed")
    }};
    ($NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {{
        $crate::paste! {
            let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
        }
        let help = $crate::metric_help!($HELP);
        $crate::prometheus::register_gauge_vec_with_registry!(
            &*name,
            &*help,
            $LABELS,
            $crate::AGENT_METRICS_REGISTRY,
        )
        .expect("metric initialization failed")
    }};
}

/// Register a monotonic integer gauge (counts that can go down, e.g. open
/// file descriptors or queue depth) with the process metrics registry.
#[macro_export]
macro_rules! register_int_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntGauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_int_gauge_with_registry!(
                    &*name,
                    &*help,
                    $crate::AGENT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
}
