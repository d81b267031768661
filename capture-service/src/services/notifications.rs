//! Post-commit capture notifications.
//!
//! Dispatched as detached tasks after the ledger transaction has committed.
//! A notification failure is logged and retried once, and never rolls back
//! or blocks the financial transaction.

use crate::config::NotificationConfig;
use crate::models::{CaptureRecord, PaymentLedger};
use serde::Serialize;

#[derive(Debug, Serialize, Clone)]
pub struct CaptureEvent {
    pub reservation_id: String,
    pub capture_id: String,
    pub amount: f64,
    pub currency: String,
    pub via: String,
    pub captured_total: f64,
}

impl CaptureEvent {
    pub fn from_capture(ledger: &PaymentLedger, record: &CaptureRecord) -> Self {
        Self {
            reservation_id: ledger.reservation_id.clone(),
            capture_id: record.capture_id.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            via: record.via.as_str().to_string(),
            captured_total: ledger.captured_total,
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: config.webhook_url.clone(),
        }
    }

    /// Fire-and-forget dispatch of a capture event.
    pub fn dispatch(&self, event: CaptureEvent) {
        let Some(url) = self.webhook_url.clone() else {
            tracing::debug!(
                reservation_id = %event.reservation_id,
                "Notification webhook not configured, skipping"
            );
            return;
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            for attempt in 0..2u32 {
                match client.post(&url).json(&event).send().await {
                    Ok(response) if response.status().is_success() => {
                        tracing::debug!(
                            reservation_id = %event.reservation_id,
                            capture_id = %event.capture_id,
                            "Capture notification delivered"
                        );
                        return;
                    }
                    Ok(response) => {
                        tracing::warn!(
                            reservation_id = %event.reservation_id,
                            status = %response.status(),
                            attempt,
                            "Capture notification rejected"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            reservation_id = %event.reservation_id,
                            error = %err,
                            attempt,
                            "Capture notification failed"
                        );
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
            tracing::error!(
                reservation_id = %event.reservation_id,
                capture_id = %event.capture_id,
                "Capture notification dropped after retries"
            );
        });
    }
}
