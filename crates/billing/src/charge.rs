//! Idempotent charge engine
//!
//! Charges are created locally first and pushed to Stripe later, possibly by
//! a batch job, possibly more than once. Every remote call carries a
//! deterministic idempotency key and local state is re-read immediately
//! before acting, so at-least-once delivery never double-bills.

use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{ChargeObject, ChargeParams, ProcessorError, ProcessorErrorKind, StripeClient};
use crate::customer::Customer;
use crate::error::{BillingError, BillingResult};
use crate::signals::{BillingSignal, SignalHub};
use crate::source::{charge_idempotency_key, refund_idempotency_key, SourceRef, SourceRegistry};

const DEFAULT_CURRENCY: &str = "usd";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Charge {
    pub id: Uuid,
    pub user_id: Uuid,
    pub customer_id: Option<Uuid>,
    /// Amount in the smallest currency unit (cents)
    pub amount: i64,
    pub amount_refunded: i64,
    pub is_charged: bool,
    pub is_refunded: bool,
    /// Manual charges are skipped by the charge-pending batch job
    pub is_manual: bool,
    pub charge_attempt_failed: bool,
    pub stripe_charge_id: String,
    pub stripe_refund_id: String,
    pub description: String,
    pub comment: String,
    pub statement_descriptor: String,
    pub source_kind: Option<String>,
    pub source_object_id: Option<Uuid>,
    pub stripe_response: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Charge {
    pub async fn get(pool: &PgPool, id: Uuid) -> BillingResult<Self> {
        sqlx::query_as::<_, Charge>("SELECT * FROM stripe_charges WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| BillingError::ChargeNotFound(id.to_string()))
    }

    /// Charges waiting for the batch job: never captured, not manual, and
    /// with no failed attempt on record.
    pub async fn pending(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Charge>(
            "SELECT * FROM stripe_charges
             WHERE NOT is_charged AND NOT is_manual AND NOT charge_attempt_failed
             ORDER BY created_at",
        )
        .fetch_all(pool)
        .await
    }

    pub fn source_ref(&self) -> Option<SourceRef> {
        match (&self.source_kind, self.source_object_id) {
            (Some(kind), Some(object_id)) => Some(SourceRef {
                kind: kind.clone(),
                object_id,
            }),
            _ => None,
        }
    }
}

/// Fields for enqueueing a new local charge.
#[derive(Debug, Clone)]
pub struct NewCharge {
    pub user_id: Uuid,
    pub amount: i64,
    pub description: String,
    pub comment: String,
    pub statement_descriptor: String,
    pub is_manual: bool,
    pub source: Option<SourceRef>,
}

/// Pick the amount one refund step will move, validating it against the
/// charge's conservation invariant. An explicit amount is taken as its
/// absolute value; the sign carries no meaning.
pub fn plan_refund(amount: i64, amount_refunded: i64, requested: Option<i64>) -> BillingResult<i64> {
    let to_refund = requested.map(i64::abs).unwrap_or(amount - amount_refunded);
    if to_refund == 0 {
        return Err(BillingError::Validation(
            "refund amount must not be zero".into(),
        ));
    }
    if amount_refunded + to_refund > amount {
        return Err(BillingError::RefundsExceedCharge {
            requested: to_refund,
            refunded: amount_refunded,
            amount,
        });
    }
    Ok(to_refund)
}

/// Drives charge capture and refunds against Stripe.
#[derive(Clone)]
pub struct ChargeEngine {
    client: StripeClient,
    pool: PgPool,
    signals: SignalHub,
    registry: Arc<SourceRegistry>,
}

impl ChargeEngine {
    pub fn new(
        client: StripeClient,
        pool: PgPool,
        signals: SignalHub,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        Self {
            client,
            pool,
            signals,
            registry,
        }
    }

    /// Record a charge intent locally without contacting Stripe.
    pub async fn enqueue(&self, new: NewCharge) -> BillingResult<Charge> {
        if new.amount <= 0 {
            return Err(BillingError::Validation(
                "charge amount must be positive".into(),
            ));
        }
        if let Some(source) = &new.source {
            if !self.registry.is_registered(&source.kind) {
                return Err(BillingError::Validation(format!(
                    "unregistered source kind: {}",
                    source.kind
                )));
            }
        }

        let charge = sqlx::query_as::<_, Charge>(
            "INSERT INTO stripe_charges
                 (user_id, amount, description, comment, statement_descriptor,
                  is_manual, source_kind, source_object_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(new.user_id)
        .bind(new.amount)
        .bind(&new.description)
        .bind(&new.comment)
        .bind(&new.statement_descriptor)
        .bind(new.is_manual)
        .bind(new.source.as_ref().map(|s| s.kind.clone()))
        .bind(new.source.as_ref().map(|s| s.object_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(charge)
    }

    /// Push one pending charge to Stripe.
    ///
    /// `seed` distinguishes retries of different logical attempts; the same
    /// seed always produces the same idempotency key. Returns the remote
    /// charge on success, or `None` when the attempt was skipped (no active
    /// customer) or ended in a business-expected decline.
    pub async fn charge(&self, charge_id: Uuid, seed: &str) -> BillingResult<Option<ChargeObject>> {
        // re-read immediately before acting
        let charge = Charge::get(&self.pool, charge_id).await?;
        if charge.is_charged {
            return Err(BillingError::AlreadyCharged);
        }

        let Some(customer) = Customer::latest_active_for_user(&self.pool, charge.user_id).await?
        else {
            tracing::info!(
                charge_id = %charge.id,
                user_id = %charge.user_id,
                "no active customer, skipping charge"
            );
            return Ok(None);
        };

        let source = charge.source_ref();
        let idempotency_key = charge_idempotency_key(source.as_ref(), seed);

        let mut metadata = Vec::new();
        if let Some(source) = &source {
            metadata.push(("source_kind".to_string(), source.kind.clone()));
            metadata.push(("source_object_id".to_string(), source.object_id.to_string()));
            if let Some(label) = self.registry.label(source) {
                metadata.push(("source_label".to_string(), label));
            }
        }

        let params = ChargeParams {
            amount: charge.amount,
            currency: DEFAULT_CURRENCY,
            customer: &customer.stripe_customer_id,
            description: &charge.description,
            statement_descriptor: if charge.statement_descriptor.is_empty() {
                None
            } else {
                Some(&charge.statement_descriptor)
            },
            metadata,
        };

        match self.client.create_charge(&params, &idempotency_key).await {
            Ok((remote, raw)) => {
                self.record_success(&charge, &customer, &remote, &raw).await?;
                Ok(Some(remote))
            }
            Err(error) => self.record_failure(&charge, &customer, error).await,
        }
    }

    async fn record_success(
        &self,
        charge: &Charge,
        customer: &Customer,
        remote: &ChargeObject,
        raw: &Value,
    ) -> BillingResult<()> {
        // conditional update is the final race guard; a lost race means a
        // concurrent attempt already captured this charge
        let rows = sqlx::query(
            "UPDATE stripe_charges
             SET is_charged = TRUE,
                 customer_id = $2,
                 stripe_charge_id = $3,
                 stripe_response = $4,
                 updated_at = NOW()
             WHERE id = $1 AND NOT is_charged",
        )
        .bind(charge.id)
        .bind(customer.id)
        .bind(&remote.id)
        .bind(raw)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(BillingError::AlreadyCharged);
        }

        tracing::info!(
            charge_id = %charge.id,
            stripe_charge_id = %remote.id,
            amount = charge.amount,
            "charge captured"
        );
        self.signals.emit(BillingSignal::ChargeSucceeded {
            charge_id: charge.id,
            stripe_charge_id: remote.id.clone(),
            amount: charge.amount,
        });
        Ok(())
    }

    async fn record_failure(
        &self,
        charge: &Charge,
        customer: &Customer,
        error: ProcessorError,
    ) -> BillingResult<Option<ChargeObject>> {
        match error.kind {
            ProcessorErrorKind::CardDeclined => {
                self.mark_attempt_failed(charge, customer, &error).await?;
                tracing::warn!(charge_id = %charge.id, %error, "card declined");
                self.signals.emit(BillingSignal::ChargeCardException {
                    charge_id: charge.id,
                    error: error.to_string(),
                });
                Ok(None)
            }
            ProcessorErrorKind::Transient => {
                self.mark_attempt_failed(charge, customer, &error).await?;
                Err(BillingError::Transient(error))
            }
            ProcessorErrorKind::InvalidRequest => {
                self.mark_attempt_failed(charge, customer, &error).await?;
                tracing::warn!(charge_id = %charge.id, %error, "charge request rejected");
                self.signals.emit(BillingSignal::ChargeCardException {
                    charge_id: charge.id,
                    error: error.to_string(),
                });
                Ok(None)
            }
            ProcessorErrorKind::Other => {
                sqlx::query(
                    "UPDATE stripe_charges
                     SET customer_id = $2, stripe_response = $3, updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(charge.id)
                .bind(customer.id)
                .bind(&error.body)
                .execute(&self.pool)
                .await?;
                Err(BillingError::Processor(error))
            }
        }
    }

    async fn mark_attempt_failed(
        &self,
        charge: &Charge,
        customer: &Customer,
        error: &ProcessorError,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE stripe_charges
             SET charge_attempt_failed = TRUE,
                 customer_id = $2,
                 stripe_charge_id = COALESCE($3, stripe_charge_id),
                 stripe_response = $4,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(charge.id)
        .bind(customer.id)
        .bind(error.charge_id.as_deref())
        .bind(if error.body.is_null() {
            json!({"message": error.message})
        } else {
            error.body.clone()
        })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refund a captured charge, fully (`amount = None`) or partially.
    ///
    /// On a remote/local bookkeeping mismatch the engine adopts Stripe's
    /// refunded total and retries exactly once; a second mismatch is
    /// surfaced as drift for an operator.
    pub async fn refund(&self, charge_id: Uuid, amount: Option<i64>) -> BillingResult<Charge> {
        let mut requested = amount;
        let mut is_retry = false;

        loop {
            let charge = Charge::get(&self.pool, charge_id).await?;
            if !charge.is_charged {
                return Err(BillingError::NotCharged);
            }
            if charge.is_refunded {
                return Err(BillingError::AlreadyRefunded);
            }

            let to_refund = plan_refund(charge.amount, charge.amount_refunded, requested)?;
            let source = charge.source_ref();
            let idempotency_key =
                refund_idempotency_key(source.as_ref(), charge.amount_refunded, to_refund);

            match self
                .client
                .create_refund(&charge.stripe_charge_id, to_refund, &idempotency_key)
                .await
            {
                Ok((remote, _raw)) => {
                    return self.apply_refund(&charge, to_refund, &remote.id).await;
                }
                Err(error) if error.kind == ProcessorErrorKind::InvalidRequest => {
                    if error.code_is("charge_already_refunded") {
                        // remote got there first; align the ledger
                        return self.apply_refund(&charge, to_refund, "").await;
                    }
                    if is_retry {
                        return Err(BillingError::ReconciliationDrift(format!(
                            "refund for charge {} failed twice against remote state: {}",
                            charge.id, error
                        )));
                    }

                    let (remote_charge, _raw) = self
                        .client
                        .retrieve_charge(&charge.stripe_charge_id)
                        .await
                        .map_err(crate::customer::wrap_processor)?;

                    if remote_charge.amount_refunded != charge.amount_refunded {
                        tracing::warn!(
                            charge_id = %charge.id,
                            local = charge.amount_refunded,
                            remote = remote_charge.amount_refunded,
                            "adopting remote refunded total"
                        );
                        sqlx::query(
                            "UPDATE stripe_charges
                             SET amount_refunded = $2,
                                 is_refunded = ($2 >= amount),
                                 updated_at = NOW()
                             WHERE id = $1",
                        )
                        .bind(charge.id)
                        .bind(remote_charge.amount_refunded)
                        .execute(&self.pool)
                        .await?;
                        requested = None;
                        is_retry = true;
                        continue;
                    }
                    return Err(BillingError::Processor(error));
                }
                Err(error) => return Err(crate::customer::wrap_processor(error)),
            }
        }
    }

    async fn apply_refund(
        &self,
        charge: &Charge,
        to_refund: i64,
        stripe_refund_id: &str,
    ) -> BillingResult<Charge> {
        // conditional on the refunded baseline we planned against
        let updated = sqlx::query_as::<_, Charge>(
            "UPDATE stripe_charges
             SET amount_refunded = amount_refunded + $2,
                 is_refunded = (amount_refunded + $2 >= amount),
                 stripe_refund_id = CASE WHEN $3 <> '' THEN $3 ELSE stripe_refund_id END,
                 updated_at = NOW()
             WHERE id = $1 AND amount_refunded = $4
             RETURNING *",
        )
        .bind(charge.id)
        .bind(to_refund)
        .bind(stripe_refund_id)
        .bind(charge.amount_refunded)
        .fetch_optional(&self.pool)
        .await?;

        let Some(updated) = updated else {
            return Err(BillingError::ReconciliationDrift(format!(
                "charge {} was refunded concurrently",
                charge.id
            )));
        };

        tracing::info!(
            charge_id = %updated.id,
            refunded = to_refund,
            total_refunded = updated.amount_refunded,
            fully_refunded = updated.is_refunded,
            "refund applied"
        );
        self.signals.emit(BillingSignal::ChargeRefunded {
            charge_id: updated.id,
            amount_refunded: updated.amount_refunded,
            is_refunded: updated.is_refunded,
        });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_refund_defaults_to_remainder() {
        assert_eq!(plan_refund(1000, 0, None).unwrap(), 1000);
        assert_eq!(plan_refund(1000, 300, None).unwrap(), 700);
    }

    #[test]
    fn partial_refund_respects_conservation() {
        assert_eq!(plan_refund(1000, 300, Some(700)).unwrap(), 700);
        match plan_refund(1000, 300, Some(701)).unwrap_err() {
            BillingError::RefundsExceedCharge {
                requested,
                refunded,
                amount,
            } => {
                assert_eq!((requested, refunded, amount), (701, 300, 1000));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn negative_amount_means_its_absolute_value() {
        assert_eq!(plan_refund(1000, 0, Some(-300)).unwrap(), 300);
        match plan_refund(1000, 300, Some(-701)).unwrap_err() {
            BillingError::RefundsExceedCharge { requested, .. } => assert_eq!(requested, 701),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn zero_refund_rejected() {
        assert!(matches!(
            plan_refund(1000, 0, Some(0)),
            Err(BillingError::Validation(_))
        ));
    }
}
