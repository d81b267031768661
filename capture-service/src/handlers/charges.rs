//! Charge and ledger endpoints.
//!
//! Thin layer: validate the payload, hand off to the orchestrator, shape
//! the response. No money logic lives here.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::dtos::{
    AttachPaymentMethodRequest, ChargeRequest, ChargeResponse, CheckoutRequest, CheckoutResponse,
    LedgerResponse, LinkPayRequest, LinkPayResponse, ReviseLimitRequest,
};
use crate::error::AppError;
use crate::services::orchestrator::{CheckoutArgs, LinkPayArgs};
use crate::AppState;

/// Create a reservation from a guest-approved gateway order.
pub async fn checkout(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    payload.validate()?;

    tracing::info!(
        order_id = %payload.order_id,
        mode = ?payload.mode,
        amount = payload.expected_amount,
        currency = %payload.currency,
        "Checkout requested"
    );

    let ledger = state
        .orchestrator
        .checkout(CheckoutArgs {
            order_id: payload.order_id,
            mode: payload.mode,
            expected_amount: payload.expected_amount,
            currency: payload.currency,
            capture_limit: payload.capture_limit,
            setup_reference: payload.setup_reference,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ledger.into())))
}

/// Post-stay merchant-initiated charge against a reservation's ledger.
pub async fn charge(
    State(state): State<AppState>,
    Json(payload): Json<ChargeRequest>,
) -> Result<Json<ChargeResponse>, AppError> {
    payload.validate()?;

    tracing::info!(
        reservation_id = %payload.reservation_id,
        amount = payload.amount,
        currency = %payload.currency,
        "Charge requested"
    );

    let outcome = state
        .orchestrator
        .charge(&payload.reservation_id, payload.amount, &payload.currency)
        .await?;

    Ok(Json(ChargeResponse {
        capture_id: outcome.capture_id,
        via: outcome.via.as_str().to_string(),
        ledger: outcome.ledger.into(),
    }))
}

/// Guest-initiated payment via a pay link.
pub async fn link_pay(
    State(state): State<AppState>,
    Json(payload): Json<LinkPayRequest>,
) -> Result<Json<LinkPayResponse>, AppError> {
    payload.validate()?;

    tracing::info!(
        reservation_id = %payload.reservation_id,
        order_id = %payload.order_id,
        mode = ?payload.mode,
        amount = payload.amount,
        "Link payment requested"
    );

    let outcome = state
        .orchestrator
        .link_pay(LinkPayArgs {
            reservation_id: payload.reservation_id,
            order_id: payload.order_id,
            mode: payload.mode,
            amount: payload.amount,
            currency: payload.currency,
        })
        .await?;

    Ok(Json(LinkPayResponse {
        capture_id: outcome.capture_id,
        ledger: outcome.ledger.into(),
    }))
}

/// Ledger snapshot for a reservation.
pub async fn get_ledger(
    State(state): State<AppState>,
    Path(reservation_id): Path<String>,
) -> Result<Json<LedgerResponse>, AppError> {
    let ledger = state.orchestrator.ledger(&reservation_id).await?;
    Ok(Json(ledger.into()))
}

/// Revise the capture limit. Rejected with 409 when the new limit is below
/// the amount already captured.
pub async fn revise_limit(
    State(state): State<AppState>,
    Path(reservation_id): Path<String>,
    Json(payload): Json<ReviseLimitRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    payload.validate()?;

    tracing::info!(
        reservation_id = %reservation_id,
        new_limit = payload.new_limit,
        "Limit revision requested"
    );

    let ledger = state
        .orchestrator
        .revise_limit(&reservation_id, payload.new_limit)
        .await?;
    Ok(Json(ledger.into()))
}

/// Vault a card for an existing reservation via a one-time setup reference.
pub async fn attach_payment_method(
    State(state): State<AppState>,
    Path(reservation_id): Path<String>,
    Json(payload): Json<AttachPaymentMethodRequest>,
) -> Result<Json<LedgerResponse>, AppError> {
    payload.validate()?;

    tracing::info!(
        reservation_id = %reservation_id,
        "Payment method attachment requested"
    );

    let ledger = state
        .orchestrator
        .attach_payment_method(&reservation_id, &payload.setup_reference)
        .await?;
    Ok(Json(ledger.into()))
}
