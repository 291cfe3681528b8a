//! Metric instrument factories.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments come from the `"labelq"` meter. Without an exporter
//! the global provider is a no-op, so recording is always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("labelq")
}

/// Counter: claim outcomes.
/// Labels: `result` ("claimed" | "resumed" | "no_work" | "conflict").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("labelq.lease.claims")
        .with_description("Claim attempts by outcome")
        .build()
}

/// Counter: voluntary releases.
/// Labels: `result` ("released" | "not_held").
pub fn releases() -> Counter<u64> {
    meter()
        .u64_counter("labelq.lease.releases")
        .with_description("Voluntary lease releases")
        .build()
}

/// Counter: commit outcomes.
/// Labels: `result` ("committed" | "not_your_lease" | "unknown_item" | "invalid").
pub fn commits() -> Counter<u64> {
    meter()
        .u64_counter("labelq.label.commits")
        .with_description("Label commits by outcome")
        .build()
}

/// Counter: expired leases returned to the pool.
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("labelq.lease.reclaimed")
        .with_description("Expired leases reclaimed by the sweep")
        .build()
}

/// Counter: conditional writes that found the item changed underneath them.
/// Labels: `transition`.
pub fn cas_lost() -> Counter<u64> {
    meter()
        .u64_counter("labelq.store.cas_lost")
        .with_description("Conditional writes that lost a race")
        .build()
}

/// Counter: requester stats updates that failed after a commit.
pub fn stats_failures() -> Counter<u64> {
    meter()
        .u64_counter("labelq.stats.failures")
        .with_description("Failed post-commit stats updates")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("labelq.operation.duration_ms")
        .with_description("Protocol operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
