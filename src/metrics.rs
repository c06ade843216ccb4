//! Client-side metrics.
//!
//! Emits through the `metrics` facade so that applications embedding the
//! client can install whichever recorder they already use.  Without a
//! recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

// -- Metric name constants ----------------------------------------------------

/// Total API requests sent (counter). Labels: method, status.
pub const REQUESTS_TOTAL: &str = "gcsclient_requests_total";

/// API request duration in seconds (histogram). Labels: method.
pub const REQUEST_DURATION_SECONDS: &str = "gcsclient_request_duration_seconds";

/// Total retries scheduled by the retry engine (counter). Labels: operation.
pub const RETRIES_TOTAL: &str = "gcsclient_retries_total";

/// Total payload bytes sent by uploads (counter).
pub const BYTES_UPLOADED_TOTAL: &str = "gcsclient_bytes_uploaded_total";

/// Total payload bytes received by downloads (counter).
pub const BYTES_DOWNLOADED_TOTAL: &str = "gcsclient_bytes_downloaded_total";

/// Register metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Total API requests sent");
    describe_histogram!(REQUEST_DURATION_SECONDS, "API request duration in seconds");
    describe_counter!(RETRIES_TOTAL, "Total retries scheduled");
    describe_counter!(BYTES_UPLOADED_TOTAL, "Total bytes uploaded");
    describe_counter!(BYTES_DOWNLOADED_TOTAL, "Total bytes downloaded");
}

/// Record one completed HTTP exchange.
pub fn record_request(method: &str, status: u16, elapsed: Duration) {
    counter!(
        REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(elapsed.as_secs_f64());
}

/// Record a scheduled retry.
pub fn record_retry(operation: &str) {
    counter!(RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

pub fn record_uploaded(bytes: u64) {
    counter!(BYTES_UPLOADED_TOTAL).increment(bytes);
}

pub fn record_downloaded(bytes: u64) {
    counter!(BYTES_DOWNLOADED_TOTAL).increment(bytes);
}
