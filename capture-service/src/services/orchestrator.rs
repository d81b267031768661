//! Charge orchestration.
//!
//! Entry points for checkout, post-stay merchant-initiated charges and
//! guest-initiated link payments. Sequencing is always the same for money
//! movement: reserve ledger capacity, call the gateway, finalize. Every
//! successful reserve is matched by exactly one finalize on all paths,
//! including gateway failures, so pending capacity can never leak.

use crate::error::AppError;
use crate::models::{
    amounts_equal, Authorization, AuthorizationStatus, CaptureRecord, CaptureVia, PaymentLedger,
    AMOUNT_EPSILON,
};
use crate::services::ledger::LedgerStore;
use crate::services::metrics;
use crate::services::notifications::{CaptureEvent, Notifier};
use crate::services::paypal::{
    GatewayAuthorization, GatewayCapture, GatewayError, PaymentGateway,
};
use crate::services::planner::{plan_capture, CapturePlan};
use crate::services::vault::VaultManager;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Whether a gateway order should be held or charged immediately.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChargeMode {
    Authorize,
    Capture,
}

/// Fresh invoice id for one capture attempt. Regenerated on every retry,
/// never mutated in place.
pub fn next_invoice_id(confirmation_number: &str, attempt: u32) -> String {
    let suffix = Utc::now().timestamp_millis() % 100_000;
    format!("{confirmation_number}-{attempt}-{suffix}")
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

fn new_confirmation_number() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("HTL-{token}")
}

#[derive(Debug, Clone)]
pub struct CheckoutArgs {
    pub order_id: String,
    pub mode: ChargeMode,
    pub expected_amount: f64,
    pub currency: String,
    /// Agreed capture cap. Defaults to the order amount.
    pub capture_limit: Option<f64>,
    /// One-time setup reference to vault the guest's card.
    pub setup_reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LinkPayArgs {
    pub reservation_id: String,
    pub order_id: String,
    pub mode: ChargeMode,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub capture_id: String,
    pub via: CaptureVia,
    pub ledger: PaymentLedger,
}

#[derive(Debug, Clone)]
pub struct LinkPayOutcome {
    pub capture_id: Option<String>,
    pub ledger: PaymentLedger,
}

/// Which gateway capture primitive a charge attempt uses.
enum CaptureCall<'a> {
    Authorization {
        authorization_id: &'a str,
        order_id: &'a str,
        final_capture: bool,
    },
    Vault {
        vault_token_id: &'a str,
        previous_capture_ref: Option<&'a str>,
    },
    Order {
        order_id: &'a str,
    },
}

impl CaptureCall<'_> {
    /// Order to query when the outcome of an attempt is unknown.
    fn resolvable_order_id(&self) -> Option<&str> {
        match self {
            Self::Authorization { order_id, .. } | Self::Order { order_id } => Some(order_id),
            Self::Vault { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct ChargeOrchestrator {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    vault: VaultManager,
    notifier: Notifier,
}

impl ChargeOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Notifier,
    ) -> Self {
        let vault = VaultManager::new(gateway.clone());
        Self {
            store,
            gateway,
            vault,
            notifier,
        }
    }

    pub async fn ledger(&self, reservation_id: &str) -> Result<PaymentLedger, AppError> {
        self.store.get(reservation_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "No payment ledger for reservation {reservation_id}"
            ))
        })
    }

    pub async fn revise_limit(
        &self,
        reservation_id: &str,
        new_limit: f64,
    ) -> Result<PaymentLedger, AppError> {
        self.store.revise_limit(reservation_id, new_limit).await
    }

    /// Exchange a setup reference and attach the resulting vault token to an
    /// existing reservation, enabling merchant-initiated charges later.
    pub async fn attach_payment_method(
        &self,
        reservation_id: &str,
        setup_reference: &str,
    ) -> Result<PaymentLedger, AppError> {
        // Fail on unknown reservations before burning the one-time token.
        self.ledger(reservation_id).await?;
        let vault = self.vault.exchange(setup_reference).await?;
        self.store.attach_vault(reservation_id, vault).await
    }

    /// Checkout: authorize or capture a guest-approved order, then create
    /// the reservation ledger. A declined authorization aborts the whole
    /// flow with no persistent side effect.
    pub async fn checkout(&self, args: CheckoutArgs) -> Result<PaymentLedger, AppError> {
        let order = self.gateway.get_order(&args.order_id).await?;

        // Fraud / UI-mismatch guard: the approved order must carry exactly
        // the amount the caller expects, before anything is mutated.
        if !amounts_equal(order.amount, args.expected_amount)
            || order.currency != args.currency
        {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Gateway order amount {:.2} {} does not match expected {:.2} {}",
                order.amount,
                order.currency,
                args.expected_amount,
                args.currency
            )));
        }

        let limit = args.capture_limit.unwrap_or(args.expected_amount);
        if limit + AMOUNT_EPSILON < args.expected_amount {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Capture limit {:.2} is below the order amount {:.2}",
                limit,
                args.expected_amount
            )));
        }

        // Setup references are single-use, so exchange before any money
        // movement; a vault failure aborts checkout cleanly.
        let vaulted = match &args.setup_reference {
            Some(reference) => Some(self.vault.exchange(reference).await?),
            None => None,
        };

        let reservation_id = new_confirmation_number();
        let mut ledger = PaymentLedger::new(&reservation_id, &args.currency, limit);
        ledger.vault = vaulted;

        match args.mode {
            ChargeMode::Authorize => {
                let authorization = self
                    .gateway
                    .authorize_order(&args.order_id, &new_request_id())
                    .await?;
                if authorization.status.is_declined() {
                    tracing::warn!(
                        order_id = %args.order_id,
                        status = ?authorization.status,
                        "Checkout authorization declined, reservation not created"
                    );
                    return Err(AppError::PaymentDeclined(
                        "Payment was declined, try another method".to_string(),
                    ));
                }
                ledger.initial_authorization =
                    Some(self.to_authorization(authorization, &args.order_id));
                self.store.create(ledger.clone()).await?;
                Ok(ledger)
            }
            ChargeMode::Capture => {
                let (capture, invoice_id) = self
                    .capture_with_idempotency(
                        CaptureCall::Order {
                            order_id: &args.order_id,
                        },
                        args.expected_amount,
                        &args.currency,
                        &reservation_id,
                        1,
                    )
                    .await?;
                if !capture.status.is_success() {
                    return Err(AppError::PaymentDeclined(
                        "Payment was declined, try another method".to_string(),
                    ));
                }

                let record = CaptureRecord {
                    capture_id: capture.id.clone(),
                    amount: capture.amount,
                    currency: capture.currency.clone(),
                    via: CaptureVia::LinkCapture,
                    invoice_id,
                    created_at: Utc::now(),
                };
                metrics::record_capture(record.via.as_str(), "success");
                metrics::record_captured_amount(&record.currency, record.amount);

                ledger.captured_total = record.amount;
                ledger.bounds.limit = ledger.bounds.limit.max(record.amount);
                ledger.capture_history.push(record.clone());
                self.store.create(ledger.clone()).await?;
                self.notifier
                    .dispatch(CaptureEvent::from_capture(&ledger, &record));
                Ok(ledger)
            }
        }
    }

    /// Post-stay merchant-initiated charge: reserve, plan, capture,
    /// finalize.
    pub async fn charge(
        &self,
        reservation_id: &str,
        amount: f64,
        currency: &str,
    ) -> Result<ChargeOutcome, AppError> {
        let ledger = self.ledger(reservation_id).await?;
        if ledger.bounds.currency != currency {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Charge currency {currency} does not match ledger currency {}",
                ledger.bounds.currency
            )));
        }

        let reserved = match self.store.reserve(reservation_id, amount).await {
            Ok(reserved) => reserved,
            Err(err) => {
                if matches!(err, AppError::CapacityExceeded { .. }) {
                    metrics::record_capacity_rejection("charge");
                }
                return Err(err);
            }
        };

        let plan = match plan_capture(&reserved, amount, Utc::now()) {
            Ok(plan) => plan,
            Err(reason) => {
                self.store.finalize(reservation_id, amount, None).await?;
                return Err(reason.into());
            }
        };

        let attempt_seq = reserved.capture_history.len() as u32 + 1;
        let result = self
            .execute_plan(reservation_id, &reserved, &plan, attempt_seq)
            .await;

        match result {
            Ok((capture, via, invoice_id)) if capture.status.is_success() => {
                let record = CaptureRecord {
                    capture_id: capture.id.clone(),
                    amount: capture.amount,
                    currency: capture.currency.clone(),
                    via,
                    invoice_id,
                    created_at: Utc::now(),
                };
                let ledger = self
                    .store
                    .finalize(reservation_id, amount, Some(record.clone()))
                    .await?;

                if via == CaptureVia::AuthCapture {
                    self.advance_authorization_status(&ledger).await;
                }

                metrics::record_capture(via.as_str(), "success");
                metrics::record_captured_amount(&record.currency, record.amount);
                self.notifier
                    .dispatch(CaptureEvent::from_capture(&ledger, &record));

                tracing::info!(
                    reservation_id,
                    capture_id = %record.capture_id,
                    via = via.as_str(),
                    amount = record.amount,
                    "Charge completed"
                );
                Ok(ChargeOutcome {
                    capture_id: record.capture_id,
                    via,
                    ledger,
                })
            }
            Ok((capture, via, _)) => {
                self.store.finalize(reservation_id, amount, None).await?;
                metrics::record_capture(via.as_str(), "declined");
                tracing::warn!(
                    reservation_id,
                    capture_id = %capture.id,
                    status = ?capture.status,
                    "Capture not successful, reservation released"
                );
                Err(AppError::PaymentDeclined(
                    "Payment was declined, try another method".to_string(),
                ))
            }
            Err(err) => {
                self.store.finalize(reservation_id, amount, None).await?;
                metrics::record_capture("unknown", "error");
                Err(err)
            }
        }
    }

    /// Guest-initiated link payment for an existing (or fresh) reservation.
    pub async fn link_pay(&self, args: LinkPayArgs) -> Result<LinkPayOutcome, AppError> {
        let order = self.gateway.get_order(&args.order_id).await?;
        if !amounts_equal(order.amount, args.amount) || order.currency != args.currency {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Gateway order amount {:.2} {} does not match requested {:.2} {}",
                order.amount,
                order.currency,
                args.amount,
                args.currency
            )));
        }

        let ledger = match self.store.get(&args.reservation_id).await? {
            Some(ledger) => ledger,
            None => {
                let ledger =
                    PaymentLedger::new(&args.reservation_id, &args.currency, args.amount);
                self.store.create(ledger.clone()).await?;
                ledger
            }
        };

        match args.mode {
            ChargeMode::Authorize => {
                let authorization = self
                    .gateway
                    .authorize_order(&args.order_id, &new_request_id())
                    .await?;
                if authorization.status.is_declined() {
                    return Err(AppError::PaymentDeclined(
                        "Payment was declined, try another method".to_string(),
                    ));
                }
                let authorization = self.to_authorization(authorization, &args.order_id);

                // Seed the bounds from the new hold when it is larger.
                if authorization.amount > ledger.bounds.limit + AMOUNT_EPSILON {
                    self.store
                        .revise_limit(&args.reservation_id, authorization.amount)
                        .await?;
                }
                let ledger = self
                    .store
                    .replace_authorization(&args.reservation_id, authorization)
                    .await?;
                Ok(LinkPayOutcome {
                    capture_id: None,
                    ledger,
                })
            }
            ChargeMode::Capture => {
                let reserved = match self.store.reserve(&args.reservation_id, args.amount).await
                {
                    Ok(reserved) => reserved,
                    Err(err) => {
                        if matches!(err, AppError::CapacityExceeded { .. }) {
                            metrics::record_capacity_rejection("link_pay");
                        }
                        return Err(err);
                    }
                };
                let attempt_seq = reserved.capture_history.len() as u32 + 1;

                let result = self
                    .capture_with_idempotency(
                        CaptureCall::Order {
                            order_id: &args.order_id,
                        },
                        args.amount,
                        &args.currency,
                        &args.reservation_id,
                        attempt_seq,
                    )
                    .await;

                match result {
                    Ok((capture, invoice_id)) if capture.status.is_success() => {
                        let record = CaptureRecord {
                            capture_id: capture.id.clone(),
                            amount: capture.amount,
                            currency: capture.currency.clone(),
                            via: CaptureVia::LinkCapture,
                            invoice_id,
                            created_at: Utc::now(),
                        };
                        let ledger = self
                            .store
                            .finalize(&args.reservation_id, args.amount, Some(record.clone()))
                            .await?;
                        metrics::record_capture(record.via.as_str(), "success");
                        metrics::record_captured_amount(&record.currency, record.amount);
                        self.notifier
                            .dispatch(CaptureEvent::from_capture(&ledger, &record));
                        Ok(LinkPayOutcome {
                            capture_id: Some(record.capture_id),
                            ledger,
                        })
                    }
                    Ok(_) => {
                        self.store
                            .finalize(&args.reservation_id, args.amount, None)
                            .await?;
                        Err(AppError::PaymentDeclined(
                            "Payment was declined, try another method".to_string(),
                        ))
                    }
                    Err(err) => {
                        self.store
                            .finalize(&args.reservation_id, args.amount, None)
                            .await?;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn execute_plan(
        &self,
        reservation_id: &str,
        ledger: &PaymentLedger,
        plan: &CapturePlan,
        attempt_seq: u32,
    ) -> Result<(GatewayCapture, CaptureVia, String), AppError> {
        let currency = ledger.bounds.currency.as_str();
        match plan {
            CapturePlan::AuthCapture {
                authorization_id,
                order_id,
                amount,
                final_capture,
            } => {
                let (capture, invoice_id) = self
                    .capture_with_idempotency(
                        CaptureCall::Authorization {
                            authorization_id,
                            order_id,
                            final_capture: *final_capture,
                        },
                        *amount,
                        currency,
                        reservation_id,
                        attempt_seq,
                    )
                    .await?;
                Ok((capture, CaptureVia::AuthCapture, invoice_id))
            }
            CapturePlan::Mit {
                vault_token_id,
                amount,
                previous_capture_ref,
            } => {
                let (capture, invoice_id) = self
                    .capture_with_idempotency(
                        CaptureCall::Vault {
                            vault_token_id,
                            previous_capture_ref: previous_capture_ref.as_deref(),
                        },
                        *amount,
                        currency,
                        reservation_id,
                        attempt_seq,
                    )
                    .await?;
                Ok((capture, CaptureVia::Mit, invoice_id))
            }
            CapturePlan::ReauthThenCapture {
                authorization_id,
                reauth_amount,
                capture_amount,
            } => {
                let reauthorized = match self
                    .gateway
                    .reauthorize(authorization_id, *reauth_amount, currency, &new_request_id())
                    .await
                {
                    Ok(reauthorized) => reauthorized,
                    Err(err) => {
                        tracing::warn!(
                            reservation_id,
                            authorization_id = authorization_id.as_str(),
                            error = %err,
                            "Reauthorization failed"
                        );
                        return Err(AppError::PaymentDeclined(
                            "Authorization expired and could not be reauthorized; \
                             ask guest to pay via a fresh link or add a card"
                                .to_string(),
                        ));
                    }
                };

                let previous_order_id = ledger
                    .initial_authorization
                    .as_ref()
                    .map(|a| a.order_id.clone())
                    .unwrap_or_default();
                let authorization = self.to_authorization(reauthorized, &previous_order_id);
                let new_auth_id = authorization.id.clone();
                let order_id = authorization.order_id.clone();
                let final_capture =
                    *capture_amount >= *reauth_amount - AMOUNT_EPSILON;

                self.store
                    .replace_authorization(reservation_id, authorization)
                    .await?;

                let (capture, invoice_id) = self
                    .capture_with_idempotency(
                        CaptureCall::Authorization {
                            authorization_id: &new_auth_id,
                            order_id: &order_id,
                            final_capture,
                        },
                        *capture_amount,
                        currency,
                        reservation_id,
                        attempt_seq,
                    )
                    .await?;
                Ok((capture, CaptureVia::AuthCapture, invoice_id))
            }
        }
    }

    async fn gateway_capture(
        &self,
        call: &CaptureCall<'_>,
        amount: f64,
        currency: &str,
        invoice_id: &str,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        match call {
            CaptureCall::Authorization {
                authorization_id,
                final_capture,
                ..
            } => {
                self.gateway
                    .capture_authorization(
                        authorization_id,
                        amount,
                        currency,
                        invoice_id,
                        *final_capture,
                        request_id,
                    )
                    .await
            }
            CaptureCall::Vault {
                vault_token_id,
                previous_capture_ref,
            } => {
                self.gateway
                    .capture_with_vault(
                        amount,
                        currency,
                        vault_token_id,
                        *previous_capture_ref,
                        invoice_id,
                        request_id,
                    )
                    .await
            }
            CaptureCall::Order { order_id } => {
                self.gateway
                    .capture_order(order_id, invoice_id, request_id)
                    .await
            }
        }
    }

    /// Execute one capture with duplicate-invoice handling: a rejected
    /// invoice id is regenerated and retried exactly once; an
    /// already-captured order is resolved by an idempotent read; an unknown
    /// outcome is resolved against the definitive order state before
    /// giving up.
    async fn capture_with_idempotency(
        &self,
        call: CaptureCall<'_>,
        amount: f64,
        currency: &str,
        confirmation_number: &str,
        attempt_seq: u32,
    ) -> Result<(GatewayCapture, String), AppError> {
        let mut invoice_id = next_invoice_id(confirmation_number, attempt_seq);

        for retry in 0..2u32 {
            let request_id = new_request_id();
            match self
                .gateway_capture(&call, amount, currency, &invoice_id, &request_id)
                .await
            {
                Ok(capture) => return Ok((capture, invoice_id)),
                Err(GatewayError::DuplicateInvoiceId) if retry == 0 => {
                    tracing::warn!(
                        confirmation_number,
                        invoice_id = %invoice_id,
                        "Invoice id already used, retrying once with a fresh id"
                    );
                    invoice_id = next_invoice_id(confirmation_number, attempt_seq + 1);
                }
                Err(GatewayError::DuplicateInvoiceId) => {
                    return Err(AppError::BadGateway(
                        "invoice id rejected as duplicate after retry".to_string(),
                    ));
                }
                Err(GatewayError::OrderAlreadyCaptured) => {
                    // A prior attempt went through; treat its capture as
                    // this attempt's result instead of charging again.
                    if let Some(order_id) = call.resolvable_order_id() {
                        if let Some(capture) = self.find_completed_capture(order_id).await {
                            tracing::info!(
                                confirmation_number,
                                order_id,
                                capture_id = %capture.id,
                                "Order already captured, adopting existing capture"
                            );
                            let invoice =
                                capture.invoice_id.clone().unwrap_or_else(|| invoice_id.clone());
                            return Ok((capture, invoice));
                        }
                    }
                    return Err(AppError::BadGateway(
                        "order reported captured but no capture found".to_string(),
                    ));
                }
                Err(GatewayError::Unreachable(msg)) => {
                    tracing::warn!(
                        confirmation_number,
                        error = %msg,
                        "Capture outcome unknown, querying definitive order state"
                    );
                    if let Some(order_id) = call.resolvable_order_id() {
                        if let Some(capture) = self.find_completed_capture(order_id).await {
                            if capture.invoice_id.as_deref() == Some(invoice_id.as_str()) {
                                return Ok((capture, invoice_id));
                            }
                        }
                    }
                    return Err(AppError::ServiceUnavailable);
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(AppError::BadGateway(
            "capture attempts exhausted".to_string(),
        ))
    }

    async fn find_completed_capture(&self, order_id: &str) -> Option<GatewayCapture> {
        match self.gateway.get_order(order_id).await {
            Ok(order) => order
                .captures
                .into_iter()
                .find(|capture| capture.status.is_success()),
            Err(err) => {
                tracing::warn!(order_id, error = %err, "Could not resolve order state");
                None
            }
        }
    }

    /// After an AUTH_CAPTURE, move the stored authorization through its
    /// state machine. Best effort: the money has already been accounted
    /// for, a stale status here is only cosmetic.
    async fn advance_authorization_status(&self, ledger: &PaymentLedger) {
        let Some(auth) = ledger.initial_authorization.as_ref() else {
            return;
        };
        let mut updated = auth.clone();
        updated.status =
            AuthorizationStatus::after_capture(auth.remaining(ledger.captured_total));
        if updated.status == auth.status {
            return;
        }
        if let Err(err) = self
            .store
            .replace_authorization(&ledger.reservation_id, updated)
            .await
        {
            tracing::warn!(
                reservation_id = %ledger.reservation_id,
                error = %err,
                "Could not advance authorization status"
            );
        }
    }

    fn to_authorization(
        &self,
        gateway_auth: GatewayAuthorization,
        fallback_order_id: &str,
    ) -> Authorization {
        Authorization {
            id: gateway_auth.id,
            order_id: gateway_auth
                .order_id
                .unwrap_or_else(|| fallback_order_id.to_string()),
            status: gateway_auth.status,
            amount: gateway_auth.amount,
            currency: gateway_auth.currency,
            expires_at: gateway_auth.expires_at,
            network_reference: gateway_auth.network_reference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::models::{VaultStatus, VaultedPaymentMethod};
    use crate::services::ledger::InMemoryLedgerStore;
    use crate::services::paypal::{CaptureStatus, OrderSnapshot, OrderStatus};
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    fn completed_capture(id: &str, amount: f64) -> GatewayCapture {
        GatewayCapture {
            id: id.to_string(),
            status: CaptureStatus::Completed,
            amount,
            currency: "EUR".to_string(),
            order_id: None,
            invoice_id: None,
        }
    }

    fn gateway_auth(id: &str, amount: f64, expires_in_hours: i64) -> GatewayAuthorization {
        GatewayAuthorization {
            id: id.to_string(),
            order_id: Some("5ORDER1".to_string()),
            status: AuthorizationStatus::Authorized,
            amount,
            currency: "EUR".to_string(),
            expires_at: Utc::now() + Duration::hours(expires_in_hours),
            network_reference: Some("NETREF-1".to_string()),
        }
    }

    /// Scriptable gateway double. Results are consumed in order.
    #[derive(Default)]
    struct MockGateway {
        orders: Mutex<HashMap<String, OrderSnapshot>>,
        authorize_results: Mutex<VecDeque<Result<GatewayAuthorization, GatewayError>>>,
        capture_auth_results: Mutex<VecDeque<Result<GatewayCapture, GatewayError>>>,
        capture_vault_results: Mutex<VecDeque<Result<GatewayCapture, GatewayError>>>,
        capture_order_results: Mutex<VecDeque<Result<GatewayCapture, GatewayError>>>,
        reauthorize_results: Mutex<VecDeque<Result<GatewayAuthorization, GatewayError>>>,
        vault_results: Mutex<VecDeque<Result<VaultedPaymentMethod, GatewayError>>>,
        capture_auth_calls: Mutex<Vec<String>>,
        capture_vault_calls: Mutex<Vec<String>>,
    }

    impl MockGateway {
        fn with_order(self, order: OrderSnapshot) -> Self {
            self.orders.lock().unwrap().insert(order.id.clone(), order);
            self
        }

        fn push_capture_auth(&self, result: Result<GatewayCapture, GatewayError>) {
            self.capture_auth_results.lock().unwrap().push_back(result);
        }

        fn auth_capture_invoices(&self) -> Vec<String> {
            self.capture_auth_calls.lock().unwrap().clone()
        }
    }

    fn order(id: &str, amount: f64) -> OrderSnapshot {
        OrderSnapshot {
            id: id.to_string(),
            status: OrderStatus::Approved,
            amount,
            currency: "EUR".to_string(),
            captures: Vec::new(),
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, GatewayError> {
            self.orders
                .lock()
                .unwrap()
                .get(order_id)
                .cloned()
                .ok_or_else(|| GatewayError::Protocol(format!("no such order {order_id}")))
        }

        async fn authorize_order(
            &self,
            _order_id: &str,
            _request_id: &str,
        ) -> Result<GatewayAuthorization, GatewayError> {
            self.authorize_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted authorize".into())))
        }

        async fn capture_order(
            &self,
            _order_id: &str,
            _invoice_id: &str,
            _request_id: &str,
        ) -> Result<GatewayCapture, GatewayError> {
            self.capture_order_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted order capture".into())))
        }

        async fn capture_authorization(
            &self,
            _authorization_id: &str,
            _amount: f64,
            _currency: &str,
            invoice_id: &str,
            _final_capture: bool,
            _request_id: &str,
        ) -> Result<GatewayCapture, GatewayError> {
            self.capture_auth_calls
                .lock()
                .unwrap()
                .push(invoice_id.to_string());
            self.capture_auth_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted auth capture".into())))
        }

        async fn capture_with_vault(
            &self,
            _amount: f64,
            _currency: &str,
            _vault_token_id: &str,
            previous_capture_ref: Option<&str>,
            _invoice_id: &str,
            _request_id: &str,
        ) -> Result<GatewayCapture, GatewayError> {
            self.capture_vault_calls
                .lock()
                .unwrap()
                .push(previous_capture_ref.unwrap_or("-").to_string());
            self.capture_vault_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted MIT capture".into())))
        }

        async fn void_authorization(&self, _authorization_id: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn reauthorize(
            &self,
            _authorization_id: &str,
            _amount: f64,
            _currency: &str,
            _request_id: &str,
        ) -> Result<GatewayAuthorization, GatewayError> {
            self.reauthorize_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted reauthorize".into())))
        }

        async fn exchange_setup_token(
            &self,
            _setup_reference: &str,
        ) -> Result<VaultedPaymentMethod, GatewayError> {
            self.vault_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayError::Protocol("no scripted vault".into())))
        }
    }

    fn orchestrator(
        gateway: Arc<MockGateway>,
        store: Arc<InMemoryLedgerStore>,
    ) -> ChargeOrchestrator {
        ChargeOrchestrator::new(
            store,
            gateway,
            Notifier::new(&NotificationConfig { webhook_url: None }),
        )
    }

    async fn seed_ledger_with_auth(
        store: &InMemoryLedgerStore,
        limit: f64,
        auth_amount: f64,
        expires_in_hours: i64,
    ) {
        let mut ledger = PaymentLedger::new("HTL-TEST", "EUR", limit);
        ledger.initial_authorization = Some(Authorization {
            id: "3AUTH1".to_string(),
            order_id: "5ORDER1".to_string(),
            status: AuthorizationStatus::Authorized,
            amount: auth_amount,
            currency: "EUR".to_string(),
            expires_at: Utc::now() + Duration::hours(expires_in_hours),
            network_reference: None,
        });
        store.create(ledger).await.unwrap();
    }

    #[tokio::test]
    async fn post_stay_auth_capture_finalizes_ledger() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_capture_auth(Ok(completed_capture("2CAP1", 60.0)));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 200.0, 100.0, 24).await;

        let orch = orchestrator(gateway, store.clone());
        let outcome = orch.charge("HTL-TEST", 60.0, "EUR").await.unwrap();

        assert_eq!(outcome.via, CaptureVia::AuthCapture);
        assert_eq!(outcome.capture_id, "2CAP1");

        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(ledger.captured_total, 60.0));
        assert!(amounts_equal(ledger.pending_total, 0.0));
        assert_eq!(ledger.capture_history.len(), 1);
        assert_eq!(
            ledger.initial_authorization.unwrap().status,
            AuthorizationStatus::PartiallyCaptured
        );
    }

    #[tokio::test]
    async fn declined_capture_releases_pending_amount() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_capture_auth(Err(GatewayError::Declined {
            code: "INSTRUMENT_DECLINED".to_string(),
            message: "declined".to_string(),
        }));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 200.0, 100.0, 24).await;

        let orch = orchestrator(gateway, store.clone());
        let err = orch.charge("HTL-TEST", 60.0, "EUR").await.unwrap_err();
        assert!(matches!(err, AppError::PaymentDeclined(_)));

        // Leak-free: the reserved amount is back to zero, nothing captured.
        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(ledger.pending_total, 0.0));
        assert!(amounts_equal(ledger.captured_total, 0.0));
        assert!(ledger.capture_history.is_empty());
    }

    #[tokio::test]
    async fn duplicate_invoice_is_retried_once_with_fresh_id() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_capture_auth(Err(GatewayError::DuplicateInvoiceId));
        gateway.push_capture_auth(Ok(completed_capture("2CAP2", 60.0)));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 200.0, 100.0, 24).await;

        let orch = orchestrator(gateway.clone(), store.clone());
        let outcome = orch.charge("HTL-TEST", 60.0, "EUR").await.unwrap();
        assert_eq!(outcome.capture_id, "2CAP2");

        let invoices = gateway.auth_capture_invoices();
        assert_eq!(invoices.len(), 2);
        assert_ne!(invoices[0], invoices[1]);

        // Exactly one capture recorded despite the retry.
        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert_eq!(ledger.capture_history.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_invoice_twice_is_a_hard_failure() {
        let gateway = Arc::new(MockGateway::default());
        gateway.push_capture_auth(Err(GatewayError::DuplicateInvoiceId));
        gateway.push_capture_auth(Err(GatewayError::DuplicateInvoiceId));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 200.0, 100.0, 24).await;

        let orch = orchestrator(gateway, store.clone());
        let err = orch.charge("HTL-TEST", 60.0, "EUR").await.unwrap_err();
        assert!(matches!(err, AppError::BadGateway(_)));

        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(ledger.pending_total, 0.0));
    }

    #[tokio::test]
    async fn already_captured_order_is_adopted_not_recharged() {
        let mut existing = order("5ORDER1", 60.0);
        existing.captures.push(GatewayCapture {
            id: "2CAP-PRIOR".to_string(),
            status: CaptureStatus::Completed,
            amount: 60.0,
            currency: "EUR".to_string(),
            order_id: Some("5ORDER1".to_string()),
            invoice_id: Some("HTL-TEST-1-1".to_string()),
        });
        let gateway = Arc::new(MockGateway::default().with_order(existing));
        gateway.push_capture_auth(Err(GatewayError::OrderAlreadyCaptured));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 200.0, 100.0, 24).await;

        let orch = orchestrator(gateway.clone(), store.clone());
        let outcome = orch.charge("HTL-TEST", 60.0, "EUR").await.unwrap();
        assert_eq!(outcome.capture_id, "2CAP-PRIOR");

        // One gateway capture attempt, one ledger record.
        assert_eq!(gateway.auth_capture_invoices().len(), 1);
        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert_eq!(ledger.capture_history.len(), 1);
        assert!(amounts_equal(ledger.captured_total, 60.0));
    }

    #[tokio::test]
    async fn unknown_outcome_resolves_against_definitive_order_state() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER1", 60.0)));
        gateway.push_capture_auth(Err(GatewayError::Unreachable("timeout".to_string())));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 200.0, 100.0, 24).await;

        let orch = orchestrator(gateway, store.clone());
        // The order shows no completed capture, so the attempt fails and
        // the reservation is released.
        let err = orch.charge("HTL-TEST", 60.0, "EUR").await.unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable));

        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(ledger.pending_total, 0.0));
        assert!(ledger.capture_history.is_empty());
    }

    #[tokio::test]
    async fn mit_charge_cites_previous_capture_reference() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .capture_vault_results
            .lock()
            .unwrap()
            .push_back(Ok(completed_capture("2CAP-MIT", 50.0)));
        let store = Arc::new(InMemoryLedgerStore::new());

        let mut ledger = PaymentLedger::new("HTL-TEST", "EUR", 500.0);
        ledger.vault = Some(VaultedPaymentMethod {
            token_id: "8kk8451t".to_string(),
            status: VaultStatus::Active,
            brand: None,
            last4: None,
            expiry: None,
        });
        ledger.captured_total = 100.0;
        ledger.capture_history.push(CaptureRecord {
            capture_id: "2CAP-FIRST".to_string(),
            amount: 100.0,
            currency: "EUR".to_string(),
            via: CaptureVia::LinkCapture,
            invoice_id: "HTL-TEST-1-1".to_string(),
            created_at: Utc::now(),
        });
        store.create(ledger).await.unwrap();

        let orch = orchestrator(gateway.clone(), store.clone());
        let outcome = orch.charge("HTL-TEST", 50.0, "EUR").await.unwrap();
        assert_eq!(outcome.via, CaptureVia::Mit);

        let refs = gateway.capture_vault_calls.lock().unwrap().clone();
        assert_eq!(refs, vec!["2CAP-FIRST".to_string()]);

        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(ledger.captured_total, 150.0));
    }

    #[tokio::test]
    async fn expired_authorization_is_reauthorized_then_captured() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .reauthorize_results
            .lock()
            .unwrap()
            .push_back(Ok(gateway_auth("3AUTH-NEW", 200.0, 24 * 29)));
        gateway.push_capture_auth(Ok(completed_capture("2CAP-RE", 150.0)));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 300.0, 200.0, -1).await;

        let orch = orchestrator(gateway, store.clone());
        let outcome = orch.charge("HTL-TEST", 150.0, "EUR").await.unwrap();
        assert_eq!(outcome.via, CaptureVia::AuthCapture);
        assert_eq!(outcome.capture_id, "2CAP-RE");

        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        let auth = ledger.initial_authorization.unwrap();
        assert_eq!(auth.id, "3AUTH-NEW");
        assert!(amounts_equal(ledger.captured_total, 150.0));
    }

    #[tokio::test]
    async fn failed_reauthorize_releases_reservation_and_reports_clearly() {
        let gateway = Arc::new(MockGateway::default());
        gateway
            .reauthorize_results
            .lock()
            .unwrap()
            .push_back(Err(GatewayError::AuthorizationExpired));
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 300.0, 200.0, -1).await;
        let before = store.get("HTL-TEST").await.unwrap().unwrap();

        let orch = orchestrator(gateway, store.clone());
        let err = orch.charge("HTL-TEST", 150.0, "EUR").await.unwrap_err();
        match err {
            AppError::PaymentDeclined(reason) => {
                assert!(reason.contains("could not be reauthorized"))
            }
            other => panic!("expected PaymentDeclined, got {other:?}"),
        }

        let after = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(after.pending_total, before.pending_total));
        assert_eq!(after.initial_authorization.unwrap().id, "3AUTH1");
    }

    #[tokio::test]
    async fn capacity_rejection_is_surfaced_without_gateway_call() {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_ledger_with_auth(&store, 100.0, 100.0, 24).await;

        let orch = orchestrator(gateway.clone(), store.clone());
        orch.store.reserve("HTL-TEST", 80.0).await.unwrap();

        let err = orch.charge("HTL-TEST", 80.0, "EUR").await.unwrap_err();
        assert!(matches!(err, AppError::CapacityExceeded { .. }));
        assert!(gateway.auth_capture_invoices().is_empty());
    }

    #[tokio::test]
    async fn checkout_amount_mismatch_has_no_side_effect() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER1", 180.0)));
        let store = Arc::new(InMemoryLedgerStore::new());

        let orch = orchestrator(gateway, store);
        let err = orch
            .checkout(CheckoutArgs {
                order_id: "5ORDER1".to_string(),
                mode: ChargeMode::Authorize,
                expected_amount: 200.0,
                currency: "EUR".to_string(),
                capture_limit: None,
                setup_reference: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn checkout_denied_authorization_creates_no_reservation() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER1", 180.0)));
        let mut denied = gateway_auth("3AUTH1", 180.0, 24);
        denied.status = AuthorizationStatus::Denied;
        gateway
            .authorize_results
            .lock()
            .unwrap()
            .push_back(Ok(denied));
        let store = Arc::new(InMemoryLedgerStore::new());

        let orch = orchestrator(gateway, store);
        let err = orch
            .checkout(CheckoutArgs {
                order_id: "5ORDER1".to_string(),
                mode: ChargeMode::Authorize,
                expected_amount: 180.0,
                currency: "EUR".to_string(),
                capture_limit: None,
                setup_reference: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PaymentDeclined(_)));
    }

    #[tokio::test]
    async fn checkout_authorize_creates_seeded_ledger() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER1", 180.0)));
        gateway
            .authorize_results
            .lock()
            .unwrap()
            .push_back(Ok(gateway_auth("3AUTH1", 180.0, 24 * 29)));
        let store = Arc::new(InMemoryLedgerStore::new());

        let orch = orchestrator(gateway, store.clone());
        let ledger = orch
            .checkout(CheckoutArgs {
                order_id: "5ORDER1".to_string(),
                mode: ChargeMode::Authorize,
                expected_amount: 180.0,
                currency: "EUR".to_string(),
                capture_limit: Some(500.0),
                setup_reference: None,
            })
            .await
            .unwrap();

        assert_eq!(ledger.bounds.limit, 500.0);
        assert!(amounts_equal(ledger.captured_total, 0.0));
        let auth = ledger.initial_authorization.as_ref().unwrap();
        assert_eq!(auth.id, "3AUTH1");
        assert_eq!(auth.order_id, "5ORDER1");

        let stored = store.get(&ledger.reservation_id).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn checkout_vault_failure_aborts_before_money_moves() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER1", 180.0)));
        gateway
            .vault_results
            .lock()
            .unwrap()
            .push_back(Err(GatewayError::Declined {
                code: "TOKEN_EXPIRED".to_string(),
                message: "setup token expired".to_string(),
            }));
        let store = Arc::new(InMemoryLedgerStore::new());

        let orch = orchestrator(gateway.clone(), store);
        let err = orch
            .checkout(CheckoutArgs {
                order_id: "5ORDER1".to_string(),
                mode: ChargeMode::Capture,
                expected_amount: 180.0,
                currency: "EUR".to_string(),
                capture_limit: None,
                setup_reference: Some("5C991763VB".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::VaultExchangeFailed(_)));
        assert!(gateway.capture_order_results.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_pay_authorize_stores_fresh_authorization() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER2", 220.0)));
        gateway
            .authorize_results
            .lock()
            .unwrap()
            .push_back(Ok(gateway_auth("3AUTH-LINK", 220.0, 24 * 29)));
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .create(PaymentLedger::new("HTL-TEST", "EUR", 100.0))
            .await
            .unwrap();

        let orch = orchestrator(gateway, store.clone());
        let outcome = orch
            .link_pay(LinkPayArgs {
                reservation_id: "HTL-TEST".to_string(),
                order_id: "5ORDER2".to_string(),
                mode: ChargeMode::Authorize,
                amount: 220.0,
                currency: "EUR".to_string(),
            })
            .await
            .unwrap();

        assert!(outcome.capture_id.is_none());
        // Bounds were seeded up to the new hold, nothing captured.
        assert_eq!(outcome.ledger.bounds.limit, 220.0);
        assert!(amounts_equal(outcome.ledger.captured_total, 0.0));
        assert_eq!(
            outcome.ledger.initial_authorization.unwrap().id,
            "3AUTH-LINK"
        );
    }

    #[tokio::test]
    async fn link_pay_capture_follows_reserve_finalize_protocol() {
        let gateway = Arc::new(MockGateway::default().with_order(order("5ORDER2", 80.0)));
        gateway
            .capture_order_results
            .lock()
            .unwrap()
            .push_back(Ok(completed_capture("2CAP-LINK", 80.0)));
        let store = Arc::new(InMemoryLedgerStore::new());
        store
            .create(PaymentLedger::new("HTL-TEST", "EUR", 100.0))
            .await
            .unwrap();

        let orch = orchestrator(gateway, store.clone());
        let outcome = orch
            .link_pay(LinkPayArgs {
                reservation_id: "HTL-TEST".to_string(),
                order_id: "5ORDER2".to_string(),
                mode: ChargeMode::Capture,
                amount: 80.0,
                currency: "EUR".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.capture_id.as_deref(), Some("2CAP-LINK"));
        let ledger = store.get("HTL-TEST").await.unwrap().unwrap();
        assert!(amounts_equal(ledger.captured_total, 80.0));
        assert!(amounts_equal(ledger.pending_total, 0.0));
        assert_eq!(ledger.capture_history[0].via, CaptureVia::LinkCapture);
    }

    #[test]
    fn invoice_ids_are_fresh_per_attempt() {
        let a = next_invoice_id("HTL-42", 1);
        let b = next_invoice_id("HTL-42", 2);
        assert!(a.starts_with("HTL-42-1-"));
        assert!(b.starts_with("HTL-42-2-"));
        assert_ne!(a, b);
    }
}
