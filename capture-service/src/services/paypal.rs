//! PayPal gateway client.
//!
//! Thin, retry-aware wrapper over the gateway's authorize/capture/void/
//! reauthorize/vault REST operations. Gateway-specific issue codes are
//! normalized into [`GatewayError`]; callers never see raw response bodies.
//!
//! Only the read-only order fetch is retried on transport failure. Mutating
//! calls carry a `PayPal-Request-Id` idempotency header and are never
//! blindly resubmitted here; duplicate handling lives in the orchestrator.

use crate::config::GatewayConfig;
use crate::models::{round_cents, AuthorizationStatus, VaultStatus, VaultedPaymentMethod};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;

/// Authorizations are valid for capture for roughly 29 days when the
/// gateway omits an explicit expiry.
const DEFAULT_AUTHORIZATION_VALIDITY_DAYS: i64 = 29;

/// Refresh the OAuth token this long before its stated expiry.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

/// Normalized gateway failure vocabulary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("declined by gateway: {code}")]
    Declined { code: String, message: String },

    #[error("authorization has expired")]
    AuthorizationExpired,

    #[error("authorization unusable: {0}")]
    AuthorizationUnusable(String),

    #[error("invoice id already used")]
    DuplicateInvoiceId,

    #[error("order already captured")]
    OrderAlreadyCaptured,

    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected gateway response: {0}")]
    Protocol(String),

    #[error("gateway credentials not configured")]
    NotConfigured,
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        use crate::error::AppError;
        match err {
            GatewayError::Declined { code, .. } => AppError::PaymentDeclined(format!(
                "Payment declined by gateway ({code}), try another method"
            )),
            GatewayError::AuthorizationExpired => AppError::PaymentDeclined(
                "Authorization has expired; ask guest to pay via a fresh link or add a card"
                    .to_string(),
            ),
            GatewayError::AuthorizationUnusable(reason) => AppError::PaymentDeclined(format!(
                "Authorization cannot be charged ({reason}); ask guest to pay via a fresh link"
            )),
            GatewayError::Unreachable(_) => AppError::ServiceUnavailable,
            GatewayError::DuplicateInvoiceId
            | GatewayError::OrderAlreadyCaptured
            | GatewayError::Protocol(_) => AppError::BadGateway(err.to_string()),
            GatewayError::NotConfigured => {
                AppError::BadGateway("gateway credentials not configured".to_string())
            }
        }
    }
}

/// Gateway order statuses, parsed by exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Created,
    Saved,
    Approved,
    PayerActionRequired,
    Completed,
    Voided,
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "SAVED" => Ok(Self::Saved),
            "APPROVED" => Ok(Self::Approved),
            "PAYER_ACTION_REQUIRED" => Ok(Self::PayerActionRequired),
            "COMPLETED" => Ok(Self::Completed),
            "VOIDED" => Ok(Self::Voided),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Gateway capture statuses, parsed by exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Completed,
    Pending,
    Declined,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl CaptureStatus {
    /// A pending capture has been accepted by the gateway and will settle.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Pending)
    }
}

impl std::str::FromStr for CaptureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(Self::Completed),
            "PENDING" => Ok(Self::Pending),
            "DECLINED" => Ok(Self::Declined),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            "PARTIALLY_REFUNDED" => Ok(Self::PartiallyRefunded),
            other => Err(format!("unknown capture status: {other}")),
        }
    }
}

/// A capture as confirmed by the gateway.
#[derive(Debug, Clone)]
pub struct GatewayCapture {
    pub id: String,
    pub status: CaptureStatus,
    /// Gateway-confirmed amount. Always trusted over the requested amount.
    pub amount: f64,
    pub currency: String,
    pub order_id: Option<String>,
    pub invoice_id: Option<String>,
}

/// An authorization as returned by the gateway. The orchestrator folds this
/// into the ledger's authorization record.
#[derive(Debug, Clone)]
pub struct GatewayAuthorization {
    pub id: String,
    pub order_id: Option<String>,
    pub status: AuthorizationStatus,
    pub amount: f64,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
    pub network_reference: Option<String>,
}

/// Read-only snapshot of a gateway order.
#[derive(Debug, Clone)]
pub struct OrderSnapshot {
    pub id: String,
    pub status: OrderStatus,
    pub amount: f64,
    pub currency: String,
    pub captures: Vec<GatewayCapture>,
}

/// Abstract gateway contract. All mutating operations bear an idempotency
/// request id supplied by the caller.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, GatewayError>;

    async fn authorize_order(
        &self,
        order_id: &str,
        request_id: &str,
    ) -> Result<GatewayAuthorization, GatewayError>;

    async fn capture_order(
        &self,
        order_id: &str,
        invoice_id: &str,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError>;

    async fn capture_authorization(
        &self,
        authorization_id: &str,
        amount: f64,
        currency: &str,
        invoice_id: &str,
        final_capture: bool,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError>;

    async fn capture_with_vault(
        &self,
        amount: f64,
        currency: &str,
        vault_token_id: &str,
        previous_capture_ref: Option<&str>,
        invoice_id: &str,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError>;

    async fn void_authorization(&self, authorization_id: &str) -> Result<(), GatewayError>;

    async fn reauthorize(
        &self,
        authorization_id: &str,
        amount: f64,
        currency: &str,
        request_id: &str,
    ) -> Result<GatewayAuthorization, GatewayError>;

    async fn exchange_setup_token(
        &self,
        setup_reference: &str,
    ) -> Result<VaultedPaymentMethod, GatewayError>;
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at
            .checked_duration_since(Instant::now())
            .map(|left| left.as_secs() > TOKEN_REFRESH_MARGIN_SECS)
            .unwrap_or(false)
    }
}

/// PayPal REST client implementing [`PaymentGateway`].
#[derive(Clone)]
pub struct PaypalClient {
    client: Client,
    config: GatewayConfig,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl PaypalClient {
    pub fn new(config: GatewayConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            token: Arc::new(RwLock::new(None)),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty()
            && !self.config.client_secret.expose_secret().is_empty()
    }

    /// Return a valid access token, refreshing on staleness.
    async fn access_token(&self) -> Result<String, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured);
        }

        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.value.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let url = format!("{}/v1/oauth2/token", self.config.api_base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            tracing::error!(status = %status, "Gateway token request failed");
            return Err(GatewayError::Protocol(format!(
                "token request failed with status {status}"
            )));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad token response: {e}")))?;

        let cached = CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + std::time::Duration::from_secs(token.expires_in),
        };
        *slot = Some(cached);

        tracing::debug!(expires_in = token.expires_in, "Gateway access token refreshed");
        Ok(token.access_token)
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, String), GatewayError> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        Ok((status, body))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url, path)
    }

    async fn fetch_order_once(&self, order_id: &str) -> Result<OrderSnapshot, GatewayError> {
        let request = self.client.get(self.url(&format!("/v2/checkout/orders/{order_id}")));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let order: OrderPayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad order response: {e}")))?;
        parse_order_snapshot(order)
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GatewayError::Unreachable(err.to_string())
    } else {
        GatewayError::Protocol(err.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    name: Option<String>,
    message: Option<String>,
    details: Option<Vec<ErrorDetail>>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    issue: Option<String>,
    description: Option<String>,
}

/// Map a gateway error body to the internal vocabulary, keyed on the
/// structured issue code.
fn normalize_error(status: StatusCode, body: &str) -> GatewayError {
    let parsed: ErrorBody = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return GatewayError::Protocol(format!("status {status}, unparseable error body"))
        }
    };

    let issue = parsed
        .details
        .as_ref()
        .and_then(|d| d.first())
        .and_then(|d| d.issue.as_deref())
        .unwrap_or("");

    match issue {
        "DUPLICATE_INVOICE_ID" => GatewayError::DuplicateInvoiceId,
        "ORDER_ALREADY_CAPTURED" => GatewayError::OrderAlreadyCaptured,
        "AUTHORIZATION_EXPIRED" => GatewayError::AuthorizationExpired,
        "AUTHORIZATION_VOIDED" | "AUTHORIZATION_ALREADY_CAPTURED" => {
            GatewayError::AuthorizationUnusable(issue.to_string())
        }
        "INSTRUMENT_DECLINED" | "PAYER_CANNOT_PAY" | "TRANSACTION_REFUSED"
        | "MAX_CAPTURE_AMOUNT_EXCEEDED" | "PAYEE_BLOCKED_TRANSACTION" => GatewayError::Declined {
            code: issue.to_string(),
            message: parsed
                .details
                .as_ref()
                .and_then(|d| d.first())
                .and_then(|d| d.description.clone())
                .unwrap_or_default(),
        },
        _ => {
            let name = parsed.name.unwrap_or_else(|| format!("HTTP_{status}"));
            if status == StatusCode::UNPROCESSABLE_ENTITY {
                GatewayError::Declined {
                    code: name,
                    message: parsed.message.unwrap_or_default(),
                }
            } else {
                GatewayError::Protocol(format!(
                    "{name}: {}",
                    parsed.message.unwrap_or_default()
                ))
            }
        }
    }
}

// -- wire payloads ----------------------------------------------------------

#[derive(Deserialize)]
struct MoneyPayload {
    currency_code: String,
    value: String,
}

impl MoneyPayload {
    fn amount(&self) -> Result<f64, GatewayError> {
        self.value
            .parse::<f64>()
            .map(round_cents)
            .map_err(|_| GatewayError::Protocol(format!("bad amount value: {}", self.value)))
    }
}

#[derive(Deserialize)]
struct NetworkReferencePayload {
    id: Option<String>,
}

#[derive(Deserialize)]
struct AuthorizationPayload {
    id: String,
    status: String,
    amount: Option<MoneyPayload>,
    expiration_time: Option<String>,
    network_transaction_reference: Option<NetworkReferencePayload>,
}

#[derive(Deserialize)]
struct CapturePayload {
    id: String,
    status: String,
    amount: Option<MoneyPayload>,
    invoice_id: Option<String>,
}

#[derive(Deserialize)]
struct PaymentsPayload {
    captures: Option<Vec<CapturePayload>>,
    authorizations: Option<Vec<AuthorizationPayload>>,
}

#[derive(Deserialize)]
struct PurchaseUnitPayload {
    amount: Option<MoneyPayload>,
    payments: Option<PaymentsPayload>,
}

#[derive(Deserialize)]
struct OrderPayload {
    id: String,
    status: String,
    purchase_units: Option<Vec<PurchaseUnitPayload>>,
}

fn parse_capture(
    payload: CapturePayload,
    order_id: Option<&str>,
) -> Result<GatewayCapture, GatewayError> {
    let status: CaptureStatus = payload.status.parse().map_err(GatewayError::Protocol)?;
    let (amount, currency) = match payload.amount {
        Some(money) => (money.amount()?, money.currency_code),
        None => return Err(GatewayError::Protocol("capture missing amount".to_string())),
    };
    Ok(GatewayCapture {
        id: payload.id,
        status,
        amount,
        currency,
        order_id: order_id.map(str::to_string),
        invoice_id: payload.invoice_id,
    })
}

fn parse_authorization(
    payload: AuthorizationPayload,
    order_id: Option<&str>,
) -> Result<GatewayAuthorization, GatewayError> {
    let status: AuthorizationStatus = payload.status.parse().map_err(GatewayError::Protocol)?;
    let (amount, currency) = match payload.amount {
        Some(money) => (money.amount()?, money.currency_code),
        None => {
            return Err(GatewayError::Protocol(
                "authorization missing amount".to_string(),
            ))
        }
    };
    let expires_at = match payload.expiration_time.as_deref() {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| GatewayError::Protocol(format!("bad expiration_time: {e}")))?,
        None => Utc::now() + Duration::days(DEFAULT_AUTHORIZATION_VALIDITY_DAYS),
    };
    Ok(GatewayAuthorization {
        id: payload.id,
        order_id: order_id.map(str::to_string),
        status,
        amount,
        currency,
        expires_at,
        network_reference: payload
            .network_transaction_reference
            .and_then(|r| r.id),
    })
}

fn parse_order_snapshot(order: OrderPayload) -> Result<OrderSnapshot, GatewayError> {
    let status: OrderStatus = order.status.parse().map_err(GatewayError::Protocol)?;
    let order_id = order.id.clone();
    let unit = order
        .purchase_units
        .and_then(|mut units| if units.is_empty() { None } else { Some(units.remove(0)) })
        .ok_or_else(|| GatewayError::Protocol("order has no purchase units".to_string()))?;

    let (amount, currency) = match unit.amount {
        Some(money) => (money.amount()?, money.currency_code),
        None => return Err(GatewayError::Protocol("order missing amount".to_string())),
    };

    let captures = unit
        .payments
        .and_then(|p| p.captures)
        .unwrap_or_default()
        .into_iter()
        .map(|c| parse_capture(c, Some(&order_id)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OrderSnapshot {
        id: order_id,
        status,
        amount,
        currency,
        captures,
    })
}

fn money_json(amount: f64, currency: &str) -> serde_json::Value {
    json!({ "currency_code": currency, "value": format!("{:.2}", amount) })
}

#[async_trait]
impl PaymentGateway for PaypalClient {
    /// Fetch an order. Read-only, so transient transport failures are
    /// retried a bounded number of times.
    async fn get_order(&self, order_id: &str) -> Result<OrderSnapshot, GatewayError> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.fetch_order_once(order_id).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(GatewayError::Unreachable(msg)) => {
                    tracing::warn!(order_id, attempt, error = %msg, "Order fetch failed, retrying");
                    last_err = Some(GatewayError::Unreachable(msg));
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Protocol("order fetch failed".to_string())))
    }

    async fn authorize_order(
        &self,
        order_id: &str,
        request_id: &str,
    ) -> Result<GatewayAuthorization, GatewayError> {
        let request = self
            .client
            .post(self.url(&format!("/v2/checkout/orders/{order_id}/authorize")))
            .header("PayPal-Request-Id", request_id)
            .json(&json!({}));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let order: OrderPayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad authorize response: {e}")))?;
        let oid = order.id.clone();
        let auth = order
            .purchase_units
            .and_then(|mut units| if units.is_empty() { None } else { Some(units.remove(0)) })
            .and_then(|u| u.payments)
            .and_then(|p| p.authorizations)
            .and_then(|mut auths| if auths.is_empty() { None } else { Some(auths.remove(0)) })
            .ok_or_else(|| {
                GatewayError::Protocol("authorize response has no authorization".to_string())
            })?;

        let parsed = parse_authorization(auth, Some(&oid))?;
        tracing::info!(
            order_id = %oid,
            authorization_id = %parsed.id,
            status = ?parsed.status,
            amount = parsed.amount,
            "Order authorized"
        );
        Ok(parsed)
    }

    async fn capture_order(
        &self,
        order_id: &str,
        invoice_id: &str,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        let request = self
            .client
            .post(self.url(&format!("/v2/checkout/orders/{order_id}/capture")))
            .header("PayPal-Request-Id", request_id)
            .json(&json!({ "invoice_id": invoice_id }));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let order: OrderPayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad capture response: {e}")))?;
        let snapshot = parse_order_snapshot(order)?;
        let capture = snapshot
            .captures
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Protocol("capture response has no capture".to_string()))?;

        tracing::info!(
            order_id,
            capture_id = %capture.id,
            amount = capture.amount,
            "Order captured"
        );
        Ok(capture)
    }

    async fn capture_authorization(
        &self,
        authorization_id: &str,
        amount: f64,
        currency: &str,
        invoice_id: &str,
        final_capture: bool,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        let request = self
            .client
            .post(self.url(&format!(
                "/v2/payments/authorizations/{authorization_id}/capture"
            )))
            .header("PayPal-Request-Id", request_id)
            .json(&json!({
                "amount": money_json(amount, currency),
                "invoice_id": invoice_id,
                "final_capture": final_capture,
            }));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let payload: CapturePayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad capture response: {e}")))?;
        let capture = parse_capture(payload, None)?;
        tracing::info!(
            authorization_id,
            capture_id = %capture.id,
            amount = capture.amount,
            final_capture,
            "Authorization captured"
        );
        Ok(capture)
    }

    async fn capture_with_vault(
        &self,
        amount: f64,
        currency: &str,
        vault_token_id: &str,
        previous_capture_ref: Option<&str>,
        invoice_id: &str,
        request_id: &str,
    ) -> Result<GatewayCapture, GatewayError> {
        let mut stored_credential = json!({
            "payment_initiator": "MERCHANT",
            "payment_type": "UNSCHEDULED",
            "usage": "SUBSEQUENT",
        });
        if let Some(reference) = previous_capture_ref {
            stored_credential["previous_network_transaction_reference"] =
                json!({ "id": reference });
        }

        let request = self
            .client
            .post(self.url("/v2/checkout/orders"))
            .header("PayPal-Request-Id", request_id)
            .json(&json!({
                "intent": "CAPTURE",
                "purchase_units": [{
                    "amount": money_json(amount, currency),
                    "invoice_id": invoice_id,
                }],
                "payment_source": {
                    "card": {
                        "vault_id": vault_token_id,
                        "stored_credential": stored_credential,
                    }
                },
            }));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let order: OrderPayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad MIT response: {e}")))?;
        let snapshot = parse_order_snapshot(order)?;
        let capture = snapshot
            .captures
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Protocol("MIT response has no capture".to_string()))?;

        tracing::info!(
            capture_id = %capture.id,
            amount = capture.amount,
            vault_token = vault_token_id,
            "Merchant-initiated charge captured"
        );
        Ok(capture)
    }

    async fn void_authorization(&self, authorization_id: &str) -> Result<(), GatewayError> {
        let request = self
            .client
            .post(self.url(&format!(
                "/v2/payments/authorizations/{authorization_id}/void"
            )))
            .json(&json!({}));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }
        tracing::info!(authorization_id, "Authorization voided");
        Ok(())
    }

    async fn reauthorize(
        &self,
        authorization_id: &str,
        amount: f64,
        currency: &str,
        request_id: &str,
    ) -> Result<GatewayAuthorization, GatewayError> {
        let request = self
            .client
            .post(self.url(&format!(
                "/v2/payments/authorizations/{authorization_id}/reauthorize"
            )))
            .header("PayPal-Request-Id", request_id)
            .json(&json!({ "amount": money_json(amount, currency) }));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let payload: AuthorizationPayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad reauthorize response: {e}")))?;
        let parsed = parse_authorization(payload, None)?;
        tracing::info!(
            old_authorization_id = authorization_id,
            new_authorization_id = %parsed.id,
            amount = parsed.amount,
            "Authorization reauthorized"
        );
        Ok(parsed)
    }

    async fn exchange_setup_token(
        &self,
        setup_reference: &str,
    ) -> Result<VaultedPaymentMethod, GatewayError> {
        #[derive(Deserialize)]
        struct CardPayload {
            brand: Option<String>,
            last_digits: Option<String>,
            expiry: Option<String>,
        }
        #[derive(Deserialize)]
        struct PaymentSourcePayload {
            card: Option<CardPayload>,
        }
        #[derive(Deserialize)]
        struct VaultTokenPayload {
            id: String,
            status: Option<String>,
            payment_source: Option<PaymentSourcePayload>,
        }

        let request = self
            .client
            .post(self.url("/v3/vault/payment-tokens"))
            .json(&json!({
                "payment_source": {
                    "token": { "id": setup_reference, "type": "SETUP_TOKEN" }
                }
            }));
        let (status, body) = self.send_json(request).await?;
        if !status.is_success() {
            return Err(normalize_error(status, &body));
        }

        let payload: VaultTokenPayload = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("bad vault response: {e}")))?;
        let card = payload.payment_source.and_then(|s| s.card);
        let vault_status = match payload.status.as_deref() {
            Some("VAULTED") | Some("ACTIVE") | None => VaultStatus::Active,
            Some(other) => {
                tracing::warn!(status = other, "Vault token created in non-active state");
                VaultStatus::Suspended
            }
        };

        tracing::info!(token_id = %payload.id, "Setup token exchanged for vault token");
        Ok(VaultedPaymentMethod {
            token_id: payload.id,
            status: vault_status,
            brand: card.as_ref().and_then(|c| c.brand.clone()),
            last4: card.as_ref().and_then(|c| c.last_digits.clone()),
            expiry: card.and_then(|c| c.expiry),
        })
    }
}
