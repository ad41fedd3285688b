//! OpenTelemetry metrics for the reconciler and the API server
//!
//! Instruments are created lazily on the global meter; without an installed
//! exporter they are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("darkroom"));

// ============================================================================
// Reconciler
// ============================================================================

/// Histogram of Darkroom reconcile duration
///
/// Labels:
/// - `darkroom`: resource name
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("darkroom_reconcile_duration_seconds")
        .with_description("Duration of Darkroom reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed Darkroom reconciles
///
/// Labels:
/// - `darkroom`: resource name
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("darkroom_reconcile_errors_total")
        .with_description("Total number of Darkroom reconciliation errors")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// API server
// ============================================================================

/// Counter of API server requests
///
/// Labels:
/// - `verb`: list, get, create, delete
/// - `code`: HTTP status code
pub static API_REQUESTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("darkroom_api_requests_total")
        .with_description("Total number of API server requests")
        .with_unit("{requests}")
        .build()
});

/// Record one API server request
pub fn record_api_request(verb: &'static str, code: u16) {
    API_REQUESTS.add(
        1,
        &[
            KeyValue::new("verb", verb),
            KeyValue::new("code", i64::from(code)),
        ],
    );
}

/// Times one reconcile and records its outcome
pub struct ReconcileTimer {
    darkroom: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(darkroom: impl Into<String>) -> Self {
        Self {
            darkroom: darkroom.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("darkroom", self.darkroom),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record a failed reconcile
    pub fn error(self, retryable: bool) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("darkroom", self.darkroom.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        let error_type = if retryable { "transient" } else { "permanent" };
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("darkroom", self.darkroom),
                KeyValue::new("error_type", error_type),
            ],
        );
    }
}
