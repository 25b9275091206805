//! Tracing and telemetry instrumentation for gantry.
//!
//! Every public coordinator operation runs inside one of the spans created
//! here, and lifecycle events are reported through the `record_*` helpers.
//! The helpers always emit a tracing event and additionally update the
//! Prometheus metrics in [`crate::metrics`] when the `metrics` feature is
//! enabled.
//!
//! # Example
//!
//! ```ignore
//! use gantry::telemetry::{track_span, record_changed};
//! use tracing::Instrument;
//!
//! async { record_changed("CondorPlugin", 3) }.instrument(track_span()).await;
//! ```

use std::time::{Duration, Instant};

use tracing::{Span, info_span};

use crate::job::CompletionOutcome;
use crate::plugin::PluginOperation;

/// Span for a submit call.
#[must_use]
pub fn submit_span(jobs: usize) -> Span {
    info_span!("gantry.submit", jobs = jobs)
}

/// Span for one tracking pass.
#[must_use]
pub fn track_span() -> Span {
    info_span!("gantry.track")
}

#[must_use]
pub fn kill_span(jobs: usize) -> Span {
    info_span!("gantry.kill", jobs = jobs)
}

/// Span for completing one plugin's jobs.
#[must_use]
pub fn complete_span(plugin: impl AsRef<str>, outcome: CompletionOutcome, jobs: usize) -> Span {
    info_span!(
        "gantry.complete",
        plugin = %plugin.as_ref(),
        outcome = %outcome,
        jobs = jobs,
    )
}

#[must_use]
pub fn remove_complete_span(jobs: usize) -> Span {
    info_span!("gantry.remove_complete", jobs = jobs)
}

#[must_use]
pub fn monitor_span() -> Span {
    info_span!("gantry.monitor")
}

/// Record jobs leaving `submit` with the given result
/// (`accepted`, `rejected`, `unroutable` or `duplicate`).
pub fn record_submitted(plugin: impl AsRef<str>, result: &str, count: usize) {
    if count == 0 {
        return;
    }
    tracing::info!(plugin = %plugin.as_ref(), result, count, "jobs submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_submitted(plugin.as_ref(), result, count);
}

/// Record status transitions written back after tracking.
pub fn record_changed(plugin: impl AsRef<str>, count: usize) {
    if count == 0 {
        return;
    }
    tracing::info!(plugin = %plugin.as_ref(), count, "job states changed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_changed(plugin.as_ref(), count);
}

pub fn record_completed(plugin: impl AsRef<str>, outcome: CompletionOutcome, count: usize) {
    tracing::info!(
        plugin = %plugin.as_ref(),
        outcome = %outcome,
        count,
        "jobs completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_completed(plugin.as_ref(), outcome.as_str(), count);
}

/// Record jobs whose working-set entry was rebuilt from the durable store.
pub fn record_recovered(count: usize) {
    if count == 0 {
        return;
    }
    tracing::info!(count, "recovered jobs missing from the working set");

    #[cfg(feature = "metrics")]
    crate::metrics::record_recovered(count);
}

pub fn record_removed(count: u64) {
    tracing::info!(count, "removed completed jobs");

    #[cfg(feature = "metrics")]
    crate::metrics::record_removed(count);
}

pub fn set_working_set_size(size: usize) {
    tracing::debug!(size, "working set size updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_working_set_size(size as f64);
}

/// Observe how long a single plugin call took.
pub fn observe_plugin_call(
    plugin: impl AsRef<str>,
    operation: PluginOperation,
    duration: Duration,
) {
    tracing::debug!(
        plugin = %plugin.as_ref(),
        operation = %operation,
        duration_secs = duration.as_secs_f64(),
        "plugin call finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_plugin_call(
        plugin.as_ref(),
        operation.as_str(),
        duration.as_secs_f64(),
    );
}

/// Start timing a plugin call. Pass the handle to [`PluginCallTimer::finish`].
pub fn start_plugin_call(plugin: impl Into<String>, operation: PluginOperation) -> PluginCallTimer {
    PluginCallTimer {
        plugin: plugin.into(),
        operation,
        start: Instant::now(),
    }
}

/// Handle for tracking plugin call duration.
#[derive(Debug)]
pub struct PluginCallTimer {
    plugin: String,
    operation: PluginOperation,
    start: Instant,
}

impl PluginCallTimer {
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and report the duration.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        observe_plugin_call(&self.plugin, self.operation, elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_span_names() {
        assert_eq!(submit_span(3).metadata().unwrap().name(), "gantry.submit");
        assert_eq!(track_span().metadata().unwrap().name(), "gantry.track");
        assert_eq!(kill_span(1).metadata().unwrap().name(), "gantry.kill");
        assert_eq!(
            remove_complete_span(2).metadata().unwrap().name(),
            "gantry.remove_complete"
        );
        assert_eq!(monitor_span().metadata().unwrap().name(), "gantry.monitor");
    }

    #[test]
    fn test_complete_span() {
        let span = complete_span("CondorPlugin", CompletionOutcome::Killed, 4);
        assert_eq!(span.metadata().unwrap().name(), "gantry.complete");
    }

    #[test]
    fn test_plugin_call_timer() {
        let timer = start_plugin_call("TestPlugin", PluginOperation::Track);
        assert_eq!(timer.plugin(), "TestPlugin");

        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed().as_nanos() > 0);
        assert!(timer.finish() >= Duration::from_millis(1));
    }

    #[test]
    fn test_record_helpers_accept_zero_counts() {
        record_submitted("TestPlugin", "accepted", 0);
        record_changed("TestPlugin", 0);
        record_recovered(0);
        record_removed(0);
        set_working_set_size(0);
    }
}
