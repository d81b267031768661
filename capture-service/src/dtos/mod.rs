//! Request and response bodies for the HTTP surface.

use crate::models::{
    Authorization, AuthorizationStatus, CaptureRecord, PaymentLedger, VaultStatus,
    VaultedPaymentMethod,
};
use crate::services::orchestrator::ChargeMode;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutRequest {
    /// Guest-approved gateway order to charge or hold.
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    pub mode: ChargeMode,
    #[validate(range(min = 0.01, message = "expected_amount must be positive"))]
    pub expected_amount: f64,
    #[validate(length(equal = 3, message = "currency must be a 3-letter code"))]
    pub currency: String,
    /// Agreed capture cap; defaults to the order amount.
    #[validate(range(min = 0.01))]
    pub capture_limit: Option<f64>,
    /// One-time setup reference to vault the guest's card.
    pub setup_reference: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChargeRequest {
    #[validate(length(min = 1, message = "reservation_id is required"))]
    pub reservation_id: String,
    #[validate(range(min = 0.01, message = "amount must be positive"))]
    pub amount: f64,
    #[validate(length(equal = 3, message = "currency must be a 3-letter code"))]
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LinkPayRequest {
    #[validate(length(min = 1, message = "reservation_id is required"))]
    pub reservation_id: String,
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    pub mode: ChargeMode,
    #[validate(range(min = 0.01, message = "amount must be positive"))]
    pub amount: f64,
    #[validate(length(equal = 3, message = "currency must be a 3-letter code"))]
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AttachPaymentMethodRequest {
    /// One-time setup reference from the gateway's card-capture flow.
    #[validate(length(min = 1, message = "setup_reference is required"))]
    pub setup_reference: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReviseLimitRequest {
    #[validate(range(min = 0.0, message = "new_limit must not be negative"))]
    pub new_limit: f64,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub reservation_id: String,
    pub ledger: LedgerResponse,
}

impl From<PaymentLedger> for CheckoutResponse {
    fn from(ledger: PaymentLedger) -> Self {
        Self {
            reservation_id: ledger.reservation_id.clone(),
            ledger: ledger.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChargeResponse {
    pub capture_id: String,
    pub via: String,
    pub ledger: LedgerResponse,
}

#[derive(Debug, Serialize)]
pub struct LinkPayResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
    pub ledger: LedgerResponse,
}

/// Client-facing ledger snapshot. Internal gateway identifiers and the full
/// vault token are not exposed.
#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub reservation_id: String,
    pub currency: String,
    pub capture_limit: f64,
    pub captured_total: f64,
    pub pending_total: f64,
    pub available: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethodView>,
    pub captures: Vec<CaptureView>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct AuthorizationView {
    pub status: AuthorizationStatus,
    pub amount: f64,
    pub remaining: f64,
    pub expires_at: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentMethodView {
    pub status: VaultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CaptureView {
    pub capture_id: String,
    pub amount: f64,
    pub currency: String,
    pub via: String,
    pub invoice_id: String,
    pub created_at: String,
}

impl From<PaymentLedger> for LedgerResponse {
    fn from(ledger: PaymentLedger) -> Self {
        let available = ledger.available();
        let authorization = ledger
            .initial_authorization
            .as_ref()
            .map(|auth| AuthorizationView::from_authorization(auth, ledger.captured_total));
        Self {
            reservation_id: ledger.reservation_id,
            currency: ledger.bounds.currency,
            capture_limit: ledger.bounds.limit,
            captured_total: ledger.captured_total,
            pending_total: ledger.pending_total,
            available,
            authorization,
            payment_method: ledger.vault.as_ref().map(PaymentMethodView::from_vault),
            captures: ledger
                .capture_history
                .into_iter()
                .map(CaptureView::from)
                .collect(),
            created_at: ledger.created_at.to_rfc3339(),
            updated_at: ledger.updated_at.to_rfc3339(),
        }
    }
}

impl AuthorizationView {
    fn from_authorization(auth: &Authorization, captured_total: f64) -> Self {
        Self {
            status: auth.status,
            amount: auth.amount,
            remaining: auth.remaining(captured_total),
            expires_at: auth.expires_at.to_rfc3339(),
        }
    }
}

impl PaymentMethodView {
    fn from_vault(vault: &VaultedPaymentMethod) -> Self {
        Self {
            status: vault.status,
            brand: vault.brand.clone(),
            last4: vault.last4.clone(),
        }
    }
}

impl From<CaptureRecord> for CaptureView {
    fn from(record: CaptureRecord) -> Self {
        Self {
            capture_id: record.capture_id,
            amount: record.amount,
            currency: record.currency,
            via: record.via.as_str().to_string(),
            invoice_id: record.invoice_id,
            created_at: record.created_at.to_rfc3339(),
        }
    }
}
