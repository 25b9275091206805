//! Prometheus metrics instrumentation for gantry.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `gantry_jobs_submitted_total` - Jobs leaving submit, by plugin and result
//! - `gantry_jobs_changed_total` - Status transitions written back after tracking
//! - `gantry_jobs_completed_total` - Jobs marked complete, by plugin and outcome
//! - `gantry_jobs_recovered_total` - Working-set entries rebuilt from storage
//! - `gantry_jobs_removed_total` - Completed jobs deleted
//!
//! ## Gauges
//! - `gantry_working_set_size` - Entries currently in the working-set cache
//!
//! ## Histograms
//! - `gantry_plugin_call_duration_seconds` - Plugin call latency
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, Gauge, HistogramVec, IntCounter, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

/// Global Prometheus registry for gantry metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `plugin`: The owning plugin
/// - `result`: `accepted`, `rejected`, `unroutable` or `duplicate`
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "gantry_jobs_submitted_total",
        "Total number of jobs passed to submit",
    );
    CounterVec::new(opts, &["plugin", "result"])
        .expect("gantry_jobs_submitted_total metric creation failed")
});

pub static JOBS_CHANGED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "gantry_jobs_changed_total",
        "Total number of job status transitions",
    );
    CounterVec::new(opts, &["plugin"]).expect("gantry_jobs_changed_total metric creation failed")
});

/// Labels:
/// - `plugin`: The owning plugin
/// - `outcome`: `finished` or `killed`
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "gantry_jobs_completed_total",
        "Total number of jobs marked complete",
    );
    CounterVec::new(opts, &["plugin", "outcome"])
        .expect("gantry_jobs_completed_total metric creation failed")
});

pub static JOBS_RECOVERED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_jobs_recovered_total",
        "Total number of jobs recovered into the working set",
    )
    .expect("gantry_jobs_recovered_total metric creation failed")
});

pub static JOBS_REMOVED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_jobs_removed_total",
        "Total number of completed jobs removed",
    )
    .expect("gantry_jobs_removed_total metric creation failed")
});

pub static WORKING_SET_SIZE: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new(
        "gantry_working_set_size",
        "Current number of entries in the working-set cache",
    )
    .expect("gantry_working_set_size metric creation failed")
});

/// Labels:
/// - `plugin`: The plugin called
/// - `operation`: check, submit, track, kill or complete
pub static PLUGIN_CALL_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "gantry_plugin_call_duration_seconds",
        "Plugin call duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["plugin", "operation"])
        .expect("gantry_plugin_call_duration_seconds metric creation failed")
});

/// Initialize all metrics by registering them with the global registry.
///
/// This function is idempotent - calling it multiple times is safe.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_CHANGED_TOTAL.clone()),
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOBS_RECOVERED_TOTAL.clone()),
        Box::new(JOBS_REMOVED_TOTAL.clone()),
        Box::new(WORKING_SET_SIZE.clone()),
        Box::new(PLUGIN_CALL_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_submitted(plugin: &str, result: &str, count: usize) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[plugin, result])
        .inc_by(count as f64);
}

pub fn record_changed(plugin: &str, count: usize) {
    JOBS_CHANGED_TOTAL
        .with_label_values(&[plugin])
        .inc_by(count as f64);
}

pub fn record_completed(plugin: &str, outcome: &str, count: usize) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[plugin, outcome])
        .inc_by(count as f64);
}

pub fn record_recovered(count: usize) {
    JOBS_RECOVERED_TOTAL.inc_by(count as u64);
}

pub fn record_removed(count: u64) {
    JOBS_REMOVED_TOTAL.inc_by(count);
}

pub fn set_working_set_size(size: f64) {
    WORKING_SET_SIZE.set(size);
}

pub fn observe_plugin_call(plugin: &str, operation: &str, duration_secs: f64) {
    PLUGIN_CALL_DURATION_SECONDS
        .with_label_values(&[plugin, operation])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
