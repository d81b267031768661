//! Payment ledger domain model.
//!
//! One `PaymentLedger` document exists per reservation. It is the only
//! shared mutable state in the service and is mutated exclusively through
//! the atomic operations on [`crate::services::LedgerStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Two amounts closer than this are considered equal (half a cent).
pub const AMOUNT_EPSILON: f64 = 0.005;

/// Compare two monetary amounts with cent tolerance.
pub fn amounts_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < AMOUNT_EPSILON
}

/// Round an amount to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// The per-reservation payment ledger.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PaymentLedger {
    /// Reservation confirmation number, doubles as the document key.
    #[serde(rename = "_id")]
    pub reservation_id: String,
    pub bounds: LedgerBounds,
    /// Sum of all completed captures. Monotonically non-decreasing.
    pub captured_total: f64,
    /// Capacity reserved for in-flight capture attempts.
    pub pending_total: f64,
    pub initial_authorization: Option<Authorization>,
    /// Append-only list of completed captures.
    pub capture_history: Vec<CaptureRecord>,
    pub vault: Option<VaultedPaymentMethod>,
    /// Audit trail of accepted limit revisions.
    pub bounds_history: Vec<BoundsRevision>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl PaymentLedger {
    pub fn new(reservation_id: impl Into<String>, currency: impl Into<String>, limit: f64) -> Self {
        let now = Utc::now();
        Self {
            reservation_id: reservation_id.into(),
            bounds: LedgerBounds {
                currency: currency.into(),
                limit: round_cents(limit),
            },
            captured_total: 0.0,
            pending_total: 0.0,
            initial_authorization: None,
            capture_history: Vec::new(),
            vault: None,
            bounds_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Capacity still available for new capture attempts.
    pub fn available(&self) -> f64 {
        round_cents(self.bounds.limit - self.captured_total - self.pending_total)
    }

    /// `captured_total + pending_total <= limit`, within cent tolerance.
    pub fn invariant_holds(&self) -> bool {
        self.captured_total + self.pending_total <= self.bounds.limit + AMOUNT_EPSILON
            && self.pending_total >= -AMOUNT_EPSILON
    }

    /// Most recent capture id, used as the prior-transaction reference for
    /// merchant-initiated charges.
    pub fn last_capture_ref(&self) -> Option<String> {
        self.capture_history
            .last()
            .map(|c| c.capture_id.clone())
            .or_else(|| {
                self.initial_authorization
                    .as_ref()
                    .and_then(|a| a.network_reference.clone())
            })
    }
}

/// Hard cap on the total money that may ever be captured for a reservation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerBounds {
    pub currency: String,
    pub limit: f64,
}

/// One accepted limit revision.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BoundsRevision {
    pub previous_limit: f64,
    pub new_limit: f64,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub revised_at: DateTime<Utc>,
}

/// Gateway-side hold of funds created at checkout.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Authorization {
    pub id: String,
    /// Gateway order the authorization was created under.
    pub order_id: String,
    pub status: AuthorizationStatus,
    pub amount: f64,
    pub currency: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,
    /// Card-network transaction reference, cited on merchant-initiated
    /// charges for network compliance.
    pub network_reference: Option<String>,
}

impl Authorization {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now || self.status == AuthorizationStatus::Expired
    }

    /// Amount still capturable against this authorization.
    pub fn remaining(&self, captured_total: f64) -> f64 {
        round_cents((self.amount - captured_total).max(0.0))
    }
}

/// Closed set of authorization states. Parsed from the gateway by exact
/// match, never by substring inspection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationStatus {
    Created,
    Authorized,
    Pending,
    PartiallyCaptured,
    Captured,
    Denied,
    Voided,
    Expired,
}

impl AuthorizationStatus {
    /// States a capture may be attempted from.
    pub fn is_capturable(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Authorized | Self::Pending | Self::PartiallyCaptured
        )
    }

    /// States that must abort reservation creation at checkout.
    pub fn is_declined(self) -> bool {
        matches!(self, Self::Denied | Self::Voided)
    }

    /// State after a successful capture leaving `remaining` authorized.
    pub fn after_capture(remaining: f64) -> Self {
        if remaining > AMOUNT_EPSILON {
            Self::PartiallyCaptured
        } else {
            Self::Captured
        }
    }
}

impl std::str::FromStr for AuthorizationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "AUTHORIZED" => Ok(Self::Authorized),
            "PENDING" => Ok(Self::Pending),
            "PARTIALLY_CAPTURED" => Ok(Self::PartiallyCaptured),
            "CAPTURED" => Ok(Self::Captured),
            "DENIED" => Ok(Self::Denied),
            "VOIDED" => Ok(Self::Voided),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown authorization status: {other}")),
        }
    }
}

/// How a completed capture was made.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureVia {
    /// Captured directly against the checkout authorization.
    AuthCapture,
    /// Merchant-initiated charge using the vaulted payment method.
    Mit,
    /// Guest-approved order capture (checkout in capture mode, or pay-link).
    LinkCapture,
}

impl CaptureVia {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthCapture => "AUTH_CAPTURE",
            Self::Mit => "MIT",
            Self::LinkCapture => "LINK_CAPTURE",
        }
    }
}

/// One completed capture. Appended to `capture_history`, never rewritten.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureRecord {
    pub capture_id: String,
    /// Gateway-confirmed amount, which may differ fractionally from the
    /// requested amount.
    pub amount: f64,
    pub currency: String,
    pub via: CaptureVia,
    pub invoice_id: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// Reusable reference to the guest's payment method.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VaultedPaymentMethod {
    pub token_id: String,
    pub status: VaultStatus,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub expiry: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VaultStatus {
    Active,
    Suspended,
}

impl VaultedPaymentMethod {
    pub fn is_usable(&self) -> bool {
        self.status == VaultStatus::Active
    }
}
