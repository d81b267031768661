//! Capture planner.
//!
//! Pure decision procedure: given the ledger state, a requested amount and
//! the current time, pick one of three charge strategies or reject with an
//! actionable reason. No I/O here; the orchestrator executes the plan.

use crate::error::AppError;
use crate::models::{PaymentLedger, AMOUNT_EPSILON};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The strategy chosen for a charge attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturePlan {
    /// Capture directly against the live checkout authorization.
    AuthCapture {
        authorization_id: String,
        order_id: String,
        amount: f64,
        /// True when this capture exhausts the remaining authorized amount.
        final_capture: bool,
    },
    /// Merchant-initiated charge against the vaulted payment method.
    Mit {
        vault_token_id: String,
        amount: f64,
        /// Prior transaction reference for card-network compliance.
        previous_capture_ref: Option<String>,
    },
    /// Reauthorize the expired authorization, then capture against the new
    /// one.
    ReauthThenCapture {
        authorization_id: String,
        reauth_amount: f64,
        capture_amount: f64,
    },
}

/// Why no capture path is viable.
#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("requested {requested:.2} exceeds remaining authorization {remaining:.2} and no saved payment method exists")]
    ExceedsRemainingAuthorization { requested: f64, remaining: f64 },

    #[error("authorization expired; requested {requested:.2} exceeds remaining authorized amount {remaining:.2} and no saved payment method exists")]
    ExpiredExceedsAuthorization { requested: f64, remaining: f64 },

    #[error("authorization was {status} and no saved payment method exists")]
    AuthorizationUnusable { status: String },

    #[error("no authorization and no saved payment method on file")]
    NoPaymentMethod,
}

impl From<PlanError> for AppError {
    fn from(err: PlanError) -> Self {
        AppError::PaymentDeclined(format!(
            "No viable capture path: {err}; ask guest to pay via a fresh link or add a card"
        ))
    }
}

/// Decide the charge strategy, evaluated in order:
/// live authorization with room, then vault, then reauthorize.
pub fn plan_capture(
    ledger: &PaymentLedger,
    requested: f64,
    now: DateTime<Utc>,
) -> Result<CapturePlan, PlanError> {
    let auth = ledger.initial_authorization.as_ref();

    if let Some(auth) = auth {
        if !auth.is_expired(now) && auth.status.is_capturable() {
            let remaining = auth.remaining(ledger.captured_total);
            if requested <= remaining + AMOUNT_EPSILON {
                return Ok(CapturePlan::AuthCapture {
                    authorization_id: auth.id.clone(),
                    order_id: auth.order_id.clone(),
                    amount: requested,
                    final_capture: requested >= remaining - AMOUNT_EPSILON,
                });
            }
        }
    }

    if let Some(vault) = ledger.vault.as_ref().filter(|v| v.is_usable()) {
        return Ok(CapturePlan::Mit {
            vault_token_id: vault.token_id.clone(),
            amount: requested,
            previous_capture_ref: ledger.last_capture_ref(),
        });
    }

    match auth {
        Some(auth) if auth.status.is_declined() => Err(PlanError::AuthorizationUnusable {
            status: format!("{:?}", auth.status).to_uppercase(),
        }),
        Some(auth) if auth.is_expired(now) => {
            let remaining = auth.remaining(ledger.captured_total);
            if requested <= remaining + AMOUNT_EPSILON {
                // Reauthorize for what is still owed, capped at the original
                // authorized amount.
                let reauth_amount = remaining.min(auth.amount);
                Ok(CapturePlan::ReauthThenCapture {
                    authorization_id: auth.id.clone(),
                    reauth_amount,
                    capture_amount: requested,
                })
            } else {
                Err(PlanError::ExpiredExceedsAuthorization {
                    requested,
                    remaining,
                })
            }
        }
        Some(auth) => Err(PlanError::ExceedsRemainingAuthorization {
            requested,
            remaining: auth.remaining(ledger.captured_total),
        }),
        None => Err(PlanError::NoPaymentMethod),
    }
}
