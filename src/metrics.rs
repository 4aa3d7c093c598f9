//! Metrics registry for signer observability
//!
//! OpenTelemetry instruments for:
//! - Signing outcomes (signed, ignored by reason, unparseable requests)
//! - Reconcile errors by class
//! - Latency of the signer call
//!
//! Instruments are no-ops until [`crate::telemetry::init_telemetry`] installs
//! an OTLP meter provider.

use std::time::Instant;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for signer metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("signer-ca"));

/// Counter of certificates written to CSR status
pub static CSRS_SIGNED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signer_ca_csrs_signed_total")
        .with_description("Total number of CertificateSigningRequests signed")
        .with_unit("{requests}")
        .build()
});

/// Counter of requests the admission gate declined
///
/// Labels:
/// - `reason`: deleted, no signer name, signer mismatch, already signed, not approved
pub static CSRS_IGNORED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signer_ca_csrs_ignored_total")
        .with_description("Total number of CertificateSigningRequests ignored by the admission gate")
        .with_unit("{requests}")
        .build()
});

/// Counter of requests whose PKCS#10 payload could not be parsed
pub static CSR_PARSE_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signer_ca_csr_parse_failures_total")
        .with_description("Total number of CertificateSigningRequests with an unparseable request")
        .with_unit("{requests}")
        .build()
});

/// Counter of reconcile errors handed back to the controller runtime
///
/// Labels:
/// - `error_type`: kube, conflict, signer, timeout, serialization, config, internal
/// - `retryable`: true, false
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("signer_ca_reconcile_errors_total")
        .with_description("Total number of CertificateSigningRequest reconcile errors")
        .with_unit("{errors}")
        .build()
});

/// Histogram of signer call duration
///
/// Labels:
/// - `result`: success, error
pub static SIGN_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("signer_ca_sign_duration_seconds")
        .with_description("Duration of certificate signing in seconds")
        .with_unit("s")
        .build()
});

/// Times one call to the signer
pub struct SignTimer {
    start: Instant,
}

impl SignTimer {
    /// Start timing a signer call
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.record("success");
    }

    /// Record failed completion (including timeouts)
    pub fn error(self) {
        self.record("error");
    }

    fn record(self, result: &'static str) {
        SIGN_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}

/// Record a certificate written to status
pub fn record_signed() {
    CSRS_SIGNED.add(1, &[]);
}

/// Record a request the admission gate declined
pub fn record_ignored(reason: &str) {
    CSRS_IGNORED.add(1, &[KeyValue::new("reason", reason.to_string())]);
}

/// Record a request whose payload could not be parsed
pub fn record_parse_failure() {
    CSR_PARSE_FAILURES.add(1, &[]);
}

/// Record a reconcile error by class
pub fn record_reconcile_error(error_type: &'static str, retryable: bool) {
    RECONCILE_ERRORS.add(
        1,
        &[
            KeyValue::new("error_type", error_type),
            KeyValue::new("retryable", retryable),
        ],
    );
}
