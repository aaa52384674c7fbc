//! Prometheus metrics for the gateway, registered in the default registry
//! and rendered by the `/system/metrics` handler and the dedicated metrics
//! listener.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_http_requests_total",
        "Total number of HTTP requests to the gateway",
        &["method", "path", "code"]
    )
    .unwrap()
});

static FUNCTION_INVOCATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "function_invocations_total",
        "Total number of function invocations",
        &["function_name", "code"]
    )
    .unwrap()
});

static FUNCTION_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "function_duration_seconds",
        "Duration of function invocations in seconds",
        &["function_name"]
    )
    .unwrap()
});

static FUNCTION_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "function_errors_total",
        "Total number of function errors",
        &["function_name"]
    )
    .unwrap()
});

static FUNCTIONS_DEPLOYED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("functions_deployed", "Number of currently deployed functions").unwrap()
});

static FUNCTION_REPLICAS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "function_replicas",
        "Number of replicas per function",
        &["function_name"]
    )
    .unwrap()
});

static GATEWAY_RESTARTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("gateway_restarts_total", "Number of gateway process starts").unwrap()
});

pub fn record_gateway_request(method: &str, path: &str, status: u16) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
}

pub fn record_function_invocation(function_name: &str, status: u16, duration_secs: f64) {
    FUNCTION_INVOCATIONS_TOTAL
        .with_label_values(&[function_name, &status.to_string()])
        .inc();
    FUNCTION_DURATION_SECONDS
        .with_label_values(&[function_name])
        .observe(duration_secs);
    if status >= 400 {
        FUNCTION_ERRORS_TOTAL.with_label_values(&[function_name]).inc();
    }
}

pub fn set_functions_deployed(count: i64) {
    FUNCTIONS_DEPLOYED.set(count);
}

pub fn set_function_replicas(function_name: &str, replicas: i64) {
    FUNCTION_REPLICAS
        .with_label_values(&[function_name])
        .set(replicas);
}

pub fn drop_function_metrics(function_name: &str) {
    let _ = FUNCTION_REPLICAS.remove_label_values(&[function_name]);
}

pub fn record_gateway_restart() {
    GATEWAY_RESTARTS_TOTAL.inc();
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::error!("Failed to encode metrics: {error}");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_series() {
        record_gateway_restart();
        record_function_invocation("echo", 200, 0.05);
        record_function_invocation("echo", 500, 0.01);
        set_functions_deployed(2);
        set_function_replicas("echo", 3);
        record_gateway_request("GET", "/system/functions", 200);

        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("gateway_restarts_total"));
        assert!(text.contains("function_invocations_total"));
        assert!(text.contains("function_errors_total"));
        assert!(text.contains("functions_deployed"));

        drop_function_metrics("echo");
    }
}
