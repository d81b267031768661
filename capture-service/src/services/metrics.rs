use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static CAPTURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CAPTURED_AMOUNT_CENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static CAPACITY_REJECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

pub fn init_metrics() {
    if PROMETHEUS_REGISTRY.get().is_some() {
        return;
    }

    let registry = Registry::new();

    let captures = IntCounterVec::new(
        Opts::new(
            "capture_attempts_total",
            "Capture attempts by strategy and outcome",
        ),
        &["via", "outcome"],
    )
    .expect("Failed to create capture_attempts_total metric");

    let amounts = IntCounterVec::new(
        Opts::new(
            "captured_amount_cents_total",
            "Captured amounts by currency, in cents",
        ),
        &["currency"],
    )
    .expect("Failed to create captured_amount_cents_total metric");

    let rejections = IntCounterVec::new(
        Opts::new(
            "capacity_rejections_total",
            "Charge attempts rejected by the ledger capacity guard",
        ),
        &["operation"],
    )
    .expect("Failed to create capacity_rejections_total metric");

    registry
        .register(Box::new(captures.clone()))
        .expect("Failed to register capture_attempts_total");
    registry
        .register(Box::new(amounts.clone()))
        .expect("Failed to register captured_amount_cents_total");
    registry
        .register(Box::new(rejections.clone()))
        .expect("Failed to register capacity_rejections_total");

    PROMETHEUS_REGISTRY.set(registry).ok();
    CAPTURES_TOTAL.set(captures).ok();
    CAPTURED_AMOUNT_CENTS_TOTAL.set(amounts).ok();
    CAPACITY_REJECTIONS_TOTAL.set(rejections).ok();
}

pub fn get_metrics() -> String {
    let Some(registry) = PROMETHEUS_REGISTRY.get() else {
        return "# Metrics not initialized\n".to_string();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer).ok();
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_capture(via: &str, outcome: &str) {
    if let Some(counter) = CAPTURES_TOTAL.get() {
        counter.with_label_values(&[via, outcome]).inc();
    }
}

pub fn record_captured_amount(currency: &str, amount: f64) {
    if let Some(counter) = CAPTURED_AMOUNT_CENTS_TOTAL.get() {
        counter
            .with_label_values(&[currency])
            .inc_by((amount * 100.0).round().max(0.0) as u64);
    }
}

pub fn record_capacity_rejection(operation: &str) {
    if let Some(counter) = CAPACITY_REJECTIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}
