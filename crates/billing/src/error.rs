//! Billing error taxonomy
//!
//! Precondition violations and validation failures are rejected before any
//! remote call is made. Processor faults are split into the retryable
//! transient class and the hard class that is re-raised unchanged.

use thiserror::Error;

use crate::client::ProcessorError;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed input, rejected before any remote call
    #[error("validation error: {0}")]
    Validation(String),

    #[error("charge has already been captured")]
    AlreadyCharged,

    #[error("cannot refund a charge that was never captured")]
    NotCharged,

    #[error("charge is already fully refunded")]
    AlreadyRefunded,

    #[error("refunds exceed charge: {requested} requested with {refunded} of {amount} already refunded")]
    RefundsExceedCharge {
        requested: i64,
        refunded: i64,
        amount: i64,
    },

    /// Entity already exists at Stripe (create_at_stripe called twice)
    #[error("already created at stripe")]
    AlreadyCreated,

    #[error("this webhook event has already been parsed")]
    AlreadyParsed,

    #[error("coupon with this coupon_id and creation date already exists")]
    CouponAlreadyExists,

    #[error("customer not found: {0}")]
    CustomerNotFound(String),

    #[error("charge not found: {0}")]
    ChargeNotFound(String),

    #[error("coupon not found: {0}")]
    CouponNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Remote and local state disagree in a way the drift-recovery path
    /// could not repair within its bounded retry
    #[error("reconciliation drift: {0}")]
    ReconciliationDrift(String),

    /// Transient Stripe fault (5xx / network); callers may retry later
    #[error("temporary stripe api error: {0}")]
    Transient(ProcessorError),

    /// Hard processor fault, surfaced unchanged for operator visibility
    #[error("stripe api error: {0}")]
    Processor(ProcessorError),

    #[error("more remote events pending than allowed: {pending} > threshold {threshold}")]
    PendingEventsThreshold { pending: usize, threshold: usize },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// True for faults a batch driver may retry without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Transient(_))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
