//! OpenTelemetry metrics for the preview operator
//!
//! - Reconcile duration and error counts
//! - Environment counts by phase
//! - TTL cleanup deletions and failures

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::crd::EnvironmentPhase;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("preview"));

/// Histogram of reconcile duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("preview_reconcile_duration_seconds")
        .with_description("Duration of PreviewEnvironment reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconcile errors
///
/// Labels:
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("preview_reconcile_errors_total")
        .with_description("Total number of PreviewEnvironment reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Gauge of environments by phase, refreshed on every cleanup pass
pub static ENVIRONMENTS_TOTAL: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("preview_environments_total")
        .with_description("Number of preview environments by phase")
        .with_unit("{environments}")
        .build()
});

/// Counter of environments deleted by TTL expiry
pub static CLEANUP_DELETIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("preview_cleanup_deletions_total")
        .with_description("Preview environments deleted after TTL expiry")
        .with_unit("{environments}")
        .build()
});

/// Counter of failed TTL deletions
pub static CLEANUP_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("preview_cleanup_failures_total")
        .with_description("Failed deletions during TTL cleanup")
        .with_unit("{errors}")
        .build()
});

/// Times a reconcile and records the outcome
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
    }
}

/// Set the environment count for a phase (`None` = not yet reconciled)
pub fn set_environment_phase_count(phase: Option<&EnvironmentPhase>, count: i64) {
    let label = phase.map(|p| p.to_string()).unwrap_or_else(|| "None".to_string());
    ENVIRONMENTS_TOTAL.record(count, &[KeyValue::new("phase", label)]);
}
