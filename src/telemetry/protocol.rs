//! Span helpers for protocol operations.

use opentelemetry::KeyValue;
use std::time::Instant;
use tracing::Span;

use super::metrics;

/// Start a span for one protocol operation.
///
/// `item` is declared empty when unknown up front (claims) and filled via
/// [`record_item`].
pub fn start_span(operation: &'static str, requester: Option<&str>, item: Option<&str>) -> Span {
    let span = tracing::info_span!(
        "labelq.op",
        "op.name" = operation,
        "requester.id" = tracing::field::Empty,
        "item.id" = tracing::field::Empty,
        "op.result" = tracing::field::Empty,
    );
    if let Some(requester) = requester {
        span.record("requester.id", requester);
    }
    if let Some(item) = item {
        span.record("item.id", item);
    }
    span
}

pub fn record_item(span: &Span, item: &str) {
    span.record("item.id", item);
}

pub fn record_result(span: &Span, result: &str) {
    span.record("op.result", result);
}

/// Record an item state transition as an event inside `span`.
pub fn record_transition(span: &Span, item: &str, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(item = item, from = from, to = to, "state_transition");
    });
}

/// Observes elapsed time into the duration histogram when dropped.
pub struct Timer {
    operation: &'static str,
    started: Instant,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        metrics::operation_duration_ms().record(ms, &[KeyValue::new("operation", self.operation)]);
    }
}
