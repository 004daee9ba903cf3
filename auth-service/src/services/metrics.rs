use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static AUTH_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static OUTBOX_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static OIDC_TOKEN_REFRESH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Create the registry and counters. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();
    let operations = counter(
        &registry,
        "auth_operations_total",
        "Authentication operations by outcome",
        &["operation", "outcome"],
    )?;
    let outbox = counter(
        &registry,
        "outbox_events_total",
        "Outbox events handled by the publisher",
        &["event_type", "outcome"],
    )?;
    let refresh = counter(
        &registry,
        "oidc_token_refresh_total",
        "Background provider token refreshes",
        &["outcome"],
    )?;

    let _ = REGISTRY.set(registry);
    let _ = AUTH_OPERATIONS_TOTAL.set(operations);
    let _ = OUTBOX_EVENTS_TOTAL.set(outbox);
    let _ = OIDC_TOKEN_REFRESH_TOTAL.set(refresh);
    Ok(())
}

pub fn record_operation(operation: &str, outcome: &str) {
    if let Some(metric) = AUTH_OPERATIONS_TOTAL.get() {
        metric.with_label_values(&[operation, outcome]).inc();
    }
}

pub fn record_outbox_event(event_type: &str, outcome: &str) {
    if let Some(metric) = OUTBOX_EVENTS_TOTAL.get() {
        metric.with_label_values(&[event_type, outcome]).inc();
    }
}

pub fn record_token_refresh(outcome: &str) {
    if let Some(metric) = OIDC_TOKEN_REFRESH_TOTAL.get() {
        metric.with_label_values(&[outcome]).inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
