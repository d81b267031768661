//! Ledger store and pending-reservation guard.
//!
//! The ledger document is the only shared mutable resource in the service.
//! Every mutation goes through a single conditional document update so that
//! concurrent charge attempts (including ones from other process instances)
//! race safely at the store, not in application code. No read-modify-write
//! without a server-side guard.

use crate::error::AppError;
use crate::models::{
    Authorization, BoundsRevision, CaptureRecord, PaymentLedger, VaultedPaymentMethod,
    AMOUNT_EPSILON,
};
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::{doc, to_bson};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Collection, Database};
use std::collections::HashMap;
use std::sync::Mutex;

/// Persistence contract for the per-reservation payment ledger.
///
/// `reserve` and `finalize` form the two-phase protocol: capacity is
/// reserved before the slow gateway round trip, and every successful
/// reserve must be matched by exactly one finalize.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create(&self, ledger: PaymentLedger) -> Result<(), AppError>;

    async fn get(&self, reservation_id: &str) -> Result<Option<PaymentLedger>, AppError>;

    /// Atomically increment `pending_total` by `amount`, only if
    /// `captured_total + pending_total + amount <= limit`.
    async fn reserve(&self, reservation_id: &str, amount: f64) -> Result<PaymentLedger, AppError>;

    /// Release a reservation made by `reserve`. With `Some(record)` the
    /// gateway-confirmed amount is promoted into `captured_total` and the
    /// record appended to history; with `None` the pending amount is
    /// reverted and nothing else changes.
    async fn finalize(
        &self,
        reservation_id: &str,
        amount: f64,
        completion: Option<CaptureRecord>,
    ) -> Result<PaymentLedger, AppError>;

    /// Raise (or equal-set) the capture limit. Rejected when the new limit
    /// is below `captured_total`. Accepted revisions are appended to the
    /// bounds history.
    async fn revise_limit(
        &self,
        reservation_id: &str,
        new_limit: f64,
    ) -> Result<PaymentLedger, AppError>;

    async fn attach_vault(
        &self,
        reservation_id: &str,
        vault: VaultedPaymentMethod,
    ) -> Result<PaymentLedger, AppError>;

    /// Replace the stored authorization record, e.g. after a reauthorize or
    /// a post-capture status transition.
    async fn replace_authorization(
        &self,
        reservation_id: &str,
        authorization: Authorization,
    ) -> Result<PaymentLedger, AppError>;
}

/// MongoDB-backed ledger store. Atomicity comes from `findOneAndUpdate`
/// with a filter that re-checks the guard condition server-side.
#[derive(Clone)]
pub struct MongoLedgerStore {
    collection: Collection<PaymentLedger>,
}

impl MongoLedgerStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection("payment_ledgers"),
        }
    }

    fn after_update() -> FindOneAndUpdateOptions {
        FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build()
    }
}

#[async_trait]
impl LedgerStore for MongoLedgerStore {
    async fn create(&self, ledger: PaymentLedger) -> Result<(), AppError> {
        self.collection.insert_one(&ledger, None).await?;
        tracing::info!(
            reservation_id = %ledger.reservation_id,
            limit = ledger.bounds.limit,
            currency = %ledger.bounds.currency,
            "Payment ledger created"
        );
        Ok(())
    }

    async fn get(&self, reservation_id: &str) -> Result<Option<PaymentLedger>, AppError> {
        let ledger = self
            .collection
            .find_one(doc! { "_id": reservation_id }, None)
            .await?;
        Ok(ledger)
    }

    async fn reserve(&self, reservation_id: &str, amount: f64) -> Result<PaymentLedger, AppError> {
        let filter = doc! {
            "_id": reservation_id,
            "$expr": {
                "$lte": [
                    { "$add": ["$captured_total", "$pending_total", amount] },
                    { "$add": ["$bounds.limit", AMOUNT_EPSILON] },
                ]
            },
        };
        let update = doc! {
            "$inc": { "pending_total": amount },
            "$set": { "updated_at": mongodb::bson::DateTime::now() },
        };

        match self
            .collection
            .find_one_and_update(filter, update, Self::after_update())
            .await?
        {
            Some(ledger) => {
                tracing::debug!(
                    reservation_id,
                    amount,
                    pending_total = ledger.pending_total,
                    "Capacity reserved"
                );
                Ok(ledger)
            }
            None => match self.get(reservation_id).await? {
                Some(ledger) => {
                    tracing::warn!(
                        reservation_id,
                        amount,
                        available = ledger.available(),
                        "Capacity reservation rejected"
                    );
                    Err(AppError::CapacityExceeded {
                        requested: amount,
                        available: ledger.available(),
                    })
                }
                None => Err(AppError::NotFound(anyhow::anyhow!(
                    "No payment ledger for reservation {reservation_id}"
                ))),
            },
        }
    }

    async fn finalize(
        &self,
        reservation_id: &str,
        amount: f64,
        completion: Option<CaptureRecord>,
    ) -> Result<PaymentLedger, AppError> {
        // The pending_total guard catches a finalize without a matching
        // reserve, which would otherwise drive the pending amount negative.
        let filter = doc! {
            "_id": reservation_id,
            "pending_total": { "$gte": amount - AMOUNT_EPSILON },
        };
        let update = match &completion {
            Some(record) => doc! {
                "$inc": {
                    "pending_total": -amount,
                    "captured_total": record.amount,
                },
                "$push": { "capture_history": to_bson(record).map_err(anyhow::Error::new)? },
                "$set": { "updated_at": mongodb::bson::DateTime::now() },
            },
            None => doc! {
                "$inc": { "pending_total": -amount },
                "$set": { "updated_at": mongodb::bson::DateTime::now() },
            },
        };

        match self
            .collection
            .find_one_and_update(filter, update, Self::after_update())
            .await?
        {
            Some(ledger) => {
                tracing::info!(
                    reservation_id,
                    amount,
                    success = completion.is_some(),
                    captured_total = ledger.captured_total,
                    pending_total = ledger.pending_total,
                    "Capacity finalized"
                );
                Ok(ledger)
            }
            None => {
                // Should never happen given the reserve/finalize pairing.
                tracing::error!(
                    reservation_id,
                    amount,
                    "Ledger invariant violation: finalize without matching reserve"
                );
                Err(AppError::InternalError(anyhow::anyhow!(
                    "finalize without matching reserve for {reservation_id}"
                )))
            }
        }
    }

    async fn revise_limit(
        &self,
        reservation_id: &str,
        new_limit: f64,
    ) -> Result<PaymentLedger, AppError> {
        let current = self
            .get(reservation_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No payment ledger for reservation {reservation_id}"
                ))
            })?;

        let revision = BoundsRevision {
            previous_limit: current.bounds.limit,
            new_limit,
            revised_at: Utc::now(),
        };

        // CAS on the current limit so a concurrent revision cannot be
        // silently overwritten, plus the captured-total guard.
        let filter = doc! {
            "_id": reservation_id,
            "bounds.limit": current.bounds.limit,
            "captured_total": { "$lte": new_limit + AMOUNT_EPSILON },
        };
        let update = doc! {
            "$set": {
                "bounds.limit": new_limit,
                "updated_at": mongodb::bson::DateTime::now(),
            },
            "$push": { "bounds_history": to_bson(&revision).map_err(anyhow::Error::new)? },
        };

        match self
            .collection
            .find_one_and_update(filter, update, Self::after_update())
            .await?
        {
            Some(ledger) => {
                tracing::info!(
                    reservation_id,
                    previous_limit = revision.previous_limit,
                    new_limit,
                    "Capture limit revised"
                );
                Ok(ledger)
            }
            None => Err(AppError::Conflict(anyhow::anyhow!(
                "Limit revision rejected: new limit {:.2} is below captured total {:.2}, \
                 or the ledger changed concurrently",
                new_limit,
                current.captured_total
            ))),
        }
    }

    async fn attach_vault(
        &self,
        reservation_id: &str,
        vault: VaultedPaymentMethod,
    ) -> Result<PaymentLedger, AppError> {
        let update = doc! {
            "$set": {
                "vault": to_bson(&vault).map_err(anyhow::Error::new)?,
                "updated_at": mongodb::bson::DateTime::now(),
            },
        };
        self.collection
            .find_one_and_update(doc! { "_id": reservation_id }, update, Self::after_update())
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No payment ledger for reservation {reservation_id}"
                ))
            })
    }

    async fn replace_authorization(
        &self,
        reservation_id: &str,
        authorization: Authorization,
    ) -> Result<PaymentLedger, AppError> {
        let update = doc! {
            "$set": {
                "initial_authorization": to_bson(&authorization).map_err(anyhow::Error::new)?,
                "updated_at": mongodb::bson::DateTime::now(),
            },
        };
        self.collection
            .find_one_and_update(doc! { "_id": reservation_id }, update, Self::after_update())
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No payment ledger for reservation {reservation_id}"
                ))
            })
    }
}

/// In-memory ledger store with the same conditional-update semantics,
/// used by tests and local development. The mutex is held for the whole
/// check-and-mutate, which is what makes each operation atomic.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    ledgers: Mutex<HashMap<String, PaymentLedger>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_ledger<T>(
        &self,
        reservation_id: &str,
        f: impl FnOnce(&mut PaymentLedger) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut ledgers = self
            .ledgers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ledger = ledgers.get_mut(reservation_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "No payment ledger for reservation {reservation_id}"
            ))
        })?;
        let result = f(ledger);
        if result.is_ok() {
            ledger.updated_at = Utc::now();
        }
        result
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create(&self, ledger: PaymentLedger) -> Result<(), AppError> {
        let mut ledgers = self
            .ledgers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if ledgers.contains_key(&ledger.reservation_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Ledger already exists for reservation {}",
                ledger.reservation_id
            )));
        }
        ledgers.insert(ledger.reservation_id.clone(), ledger);
        Ok(())
    }

    async fn get(&self, reservation_id: &str) -> Result<Option<PaymentLedger>, AppError> {
        let ledgers = self
            .ledgers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(ledgers.get(reservation_id).cloned())
    }

    async fn reserve(&self, reservation_id: &str, amount: f64) -> Result<PaymentLedger, AppError> {
        self.with_ledger(reservation_id, |ledger| {
            let projected = ledger.captured_total + ledger.pending_total + amount;
            if projected > ledger.bounds.limit + AMOUNT_EPSILON {
                return Err(AppError::CapacityExceeded {
                    requested: amount,
                    available: ledger.available(),
                });
            }
            ledger.pending_total += amount;
            Ok(ledger.clone())
        })
    }

    async fn finalize(
        &self,
        reservation_id: &str,
        amount: f64,
        completion: Option<CaptureRecord>,
    ) -> Result<PaymentLedger, AppError> {
        self.with_ledger(reservation_id, |ledger| {
            if ledger.pending_total < amount - AMOUNT_EPSILON {
                tracing::error!(
                    reservation_id,
                    amount,
                    pending_total = ledger.pending_total,
                    "Ledger invariant violation: finalize without matching reserve"
                );
                return Err(AppError::InternalError(anyhow::anyhow!(
                    "finalize without matching reserve for {reservation_id}"
                )));
            }
            ledger.pending_total -= amount;
            if let Some(record) = completion {
                ledger.captured_total += record.amount;
                ledger.capture_history.push(record);
            }
            Ok(ledger.clone())
        })
    }

    async fn revise_limit(
        &self,
        reservation_id: &str,
        new_limit: f64,
    ) -> Result<PaymentLedger, AppError> {
        self.with_ledger(reservation_id, |ledger| {
            if new_limit + AMOUNT_EPSILON < ledger.captured_total {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Limit revision rejected: new limit {:.2} is below captured total {:.2}",
                    new_limit,
                    ledger.captured_total
                )));
            }
            ledger.bounds_history.push(BoundsRevision {
                previous_limit: ledger.bounds.limit,
                new_limit,
                revised_at: Utc::now(),
            });
            ledger.bounds.limit = new_limit;
            Ok(ledger.clone())
        })
    }

    async fn attach_vault(
        &self,
        reservation_id: &str,
        vault: VaultedPaymentMethod,
    ) -> Result<PaymentLedger, AppError> {
        self.with_ledger(reservation_id, |ledger| {
            ledger.vault = Some(vault);
            Ok(ledger.clone())
        })
    }

    async fn replace_authorization(
        &self,
        reservation_id: &str,
        authorization: Authorization,
    ) -> Result<PaymentLedger, AppError> {
        self.with_ledger(reservation_id, |ledger| {
            ledger.initial_authorization = Some(authorization);
            Ok(ledger.clone())
        })
    }
}
