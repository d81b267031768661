//! Vault manager.
//!
//! Exchanges a one-time setup reference for a durable vault token. Setup
//! references are single-use, so the exchange is never retried; a failure
//! aborts the calling flow instead of silently proceeding without a vault.

use crate::error::AppError;
use crate::models::VaultedPaymentMethod;
use crate::services::paypal::PaymentGateway;
use std::sync::Arc;

#[derive(Clone)]
pub struct VaultManager {
    gateway: Arc<dyn PaymentGateway>,
}

impl VaultManager {
    pub fn new(gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { gateway }
    }

    pub async fn exchange(&self, setup_reference: &str) -> Result<VaultedPaymentMethod, AppError> {
        match self.gateway.exchange_setup_token(setup_reference).await {
            Ok(vault) => {
                tracing::info!(
                    token_id = %vault.token_id,
                    brand = vault.brand.as_deref().unwrap_or("unknown"),
                    "Payment method vaulted"
                );
                Ok(vault)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Setup token exchange failed");
                Err(AppError::VaultExchangeFailed(err.to_string()))
            }
        }
    }
}
