// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the storefront.
//
// LEARNING NOTES:
// - Prometheus scrapes GET /metrics; we only record, never push
// - Counters only go up, gauges go both ways, histograms bucket values
// - Keep label values low-cardinality: outcome names, not order numbers
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Labels: outcome (success, empty_cart, insufficient_stock, ...)
pub const CHECKOUT_ATTEMPTS_TOTAL: &str = "checkout_attempts_total";

/// Grand totals of successful orders
pub const ORDER_TOTAL_AMOUNT: &str = "order_total_amount";

/// Labels: product_id
pub const PRODUCT_STOCK_LEVEL: &str = "product_stock_level";

/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get/set/delete)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

// =============================================================================
// SETUP
// =============================================================================
/// Install the global Prometheus recorder and return its render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s; checkout can sit on a row lock for a while
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    // Order values in ringgit
    let order_buckets = &[10.0, 25.0, 50.0, 100.0, 150.0, 250.0, 500.0, 1000.0, 2500.0];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(Matcher::Full(ORDER_TOTAL_AMOUNT.to_string()), order_buckets)?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(CHECKOUT_ATTEMPTS_TOTAL, "Checkout attempts by outcome");
    describe_histogram!(ORDER_TOTAL_AMOUNT, "Grand total of placed orders");
    describe_gauge!(PRODUCT_STOCK_LEVEL, "Stock left after the last checkout touching a product");
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");

    Ok(handle)
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

/// Count one checkout attempt. `outcome` is "success" or an error kind.
pub fn record_checkout(outcome: &'static str) {
    counter!(CHECKOUT_ATTEMPTS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_order_total(total: Decimal) {
    histogram!(ORDER_TOTAL_AMOUNT).record(total.to_f64().unwrap_or_default());
}

pub fn set_stock_level(product_id: i64, level: i32) {
    gauge!(PRODUCT_STOCK_LEVEL, "product_id" => product_id.to_string()).set(level as f64);
}

pub fn record_db_query(operation: &'static str, duration_secs: f64) {
    histogram!(DB_QUERY_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

pub fn record_redis_operation(operation: &'static str, duration_secs: f64) {
    histogram!(REDIS_OPERATION_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}
