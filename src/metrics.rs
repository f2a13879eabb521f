// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the storefront, scraped from GET /metrics.
//
// LEARNING NOTES:
// - Counters only go up (transitions, webhook deliveries, released holds)
// - Gauges go up and down (units on hand)
// - Histograms bucket latencies
// - Labels stay low-cardinality: never put order ids or emails in a label
// =============================================================================

use std::time::Instant;

use anyhow::Result;
use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::models::OrderStatus;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Units on hand per product. Labels: product_id
pub const STOCK_LEVEL: &str = "storefront_stock_level";

/// Labels: from, to
pub const ORDER_TRANSITIONS_TOTAL: &str = "storefront_order_transitions_total";

/// Labels: kind, outcome (confirmed/duplicate/ignored/released/unhandled/error)
pub const WEBHOOK_EVENTS_TOTAL: &str = "storefront_webhook_events_total";

pub const RESERVATIONS_RELEASED_TOTAL: &str = "storefront_reservations_released_total";

/// Labels: outcome (valid or the rejection reason)
pub const COUPON_VALIDATIONS_TOTAL: &str = "storefront_coupon_validations_total";

/// Labels: operation (create_session/retrieve_session/refund), success
pub const PAYMENT_CALL_DURATION_SECONDS: &str = "storefront_payment_call_duration_seconds";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder and describe every metric.
///
/// # Returns
/// * `PrometheusHandle` - Used to render metrics in Prometheus format
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s; processor calls sit in the upper half
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(PAYMENT_CALL_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_gauge!(STOCK_LEVEL, "Units on hand in the stock ledger");
    describe_counter!(ORDER_TRANSITIONS_TOTAL, "Applied order status transitions");
    describe_counter!(WEBHOOK_EVENTS_TOTAL, "Payment webhook deliveries by kind and outcome");
    describe_counter!(
        RESERVATIONS_RELEASED_TOTAL,
        "Advisory stock holds released by the expiry sweep"
    );
    describe_counter!(COUPON_VALIDATIONS_TOTAL, "Coupon validations by outcome");
    describe_histogram!(
        PAYMENT_CALL_DURATION_SECONDS,
        "Payment processor call latency in seconds"
    );

    Ok(handle)
}

// =============================================================================
// HTTP MIDDLEWARE
// =============================================================================
/// Records request count and latency keyed by the matched route template, so
/// `/api/v1/orders/:id` stays one series regardless of the id.
pub async fn track_http(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    record_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

/// Update the units-on-hand gauge for a product
pub fn set_stock_level(product_id: &str, level: i32) {
    gauge!(STOCK_LEVEL, "product_id" => product_id.to_string()).set(f64::from(level));
}

pub fn record_transition(from: OrderStatus, to: OrderStatus) {
    counter!(
        ORDER_TRANSITIONS_TOTAL,
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

pub fn record_webhook(kind: &str, outcome: &'static str) {
    counter!(
        WEBHOOK_EVENTS_TOTAL,
        "kind" => kind.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_reservations_released(count: u64) {
    counter!(RESERVATIONS_RELEASED_TOTAL).increment(count);
}

pub fn record_coupon_validation(outcome: &'static str) {
    counter!(COUPON_VALIDATIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_payment_call(operation: &'static str, success: bool, duration_secs: f64) {
    let success = if success { "true" } else { "false" };
    histogram!(
        PAYMENT_CALL_DURATION_SECONDS,
        "operation" => operation,
        "success" => success
    )
    .record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_calls_and_webhooks_carry_their_documented_labels() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_payment_call("refund", false, 0.25);
            record_webhook("checkout.session.completed", "duplicate");
        });

        let rendered = handle.render();
        let payment_line = rendered
            .lines()
            .find(|line| line.starts_with(PAYMENT_CALL_DURATION_SECONDS) && line.contains("refund"))
            .unwrap();
        assert!(payment_line.contains(r#"success="false""#));
        assert!(!payment_line.contains("outcome"));
        assert!(rendered.contains(r#"outcome="duplicate""#));
    }
}
