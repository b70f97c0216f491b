//! Prometheus metrics instrumentation.
//!
//! Conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `grader_units_graded_total` - Units reaching a terminal outcome, by status
//! - `grader_images_built_total` - Image builds, by result
//!
//! ## Histograms
//! - `grader_unit_duration_seconds` - Wall-clock grading duration per unit
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for grader metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for units reaching a terminal outcome.
///
/// Labels:
/// - `status`: the unit's terminal status
pub static UNITS_GRADED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "grader_units_graded_total",
        "Units that reached a terminal outcome",
    );
    CounterVec::new(opts, &["status"]).expect("grader_units_graded_total metric creation failed")
});

/// Counter for image builds.
///
/// Labels:
/// - `result`: `built` or `failed`
pub static IMAGES_BUILT_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("grader_images_built_total", "Grading image builds");
    CounterVec::new(opts, &["result"]).expect("grader_images_built_total metric creation failed")
});

/// Histogram for per-unit grading duration in seconds.
///
/// Labels:
/// - `status`: the unit's terminal status
pub static UNIT_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.1, 2.0, 12).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "grader_unit_duration_seconds",
        "Wall-clock grading duration per unit",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["status"])
        .expect("grader_unit_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Idempotent: re-registration errors from repeat calls are ignored.
pub fn init_metrics() {
    let registry = &*REGISTRY;
    let _ = registry.register(Box::new(UNITS_GRADED_TOTAL.clone()));
    let _ = registry.register(Box::new(IMAGES_BUILT_TOTAL.clone()));
    let _ = registry.register(Box::new(UNIT_DURATION_SECONDS.clone()));
}

pub(crate) fn record_unit_graded(status: &str) {
    UNITS_GRADED_TOTAL.with_label_values(&[status]).inc();
}

pub(crate) fn record_image_built(result: &str) {
    IMAGES_BUILT_TOTAL.with_label_values(&[result]).inc();
}

pub(crate) fn observe_grading_duration(status: &str, duration_secs: f64) {
    UNIT_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_record() {
        init_metrics();
        record_unit_graded("completed");
        record_image_built("built");
        observe_grading_duration("completed", 1.5);

        let graded = UNITS_GRADED_TOTAL.with_label_values(&["completed"]).get();
        assert!(graded >= 1.0);
    }
}
