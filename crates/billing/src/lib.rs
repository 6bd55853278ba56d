//! Stripe-synchronized billing ledger.
//!
//! Local Postgres rows mirror Stripe state; Stripe is the system of record.
//! Engines in this crate push local intents (charges, coupons,
//! subscriptions) to Stripe idempotently and pull remote changes back in
//! through webhooks and reconciliation sweeps.

pub mod card;
pub mod charge;
pub mod client;
pub mod coupon;
pub mod customer;
pub mod error;
pub mod signals;
pub mod source;
pub mod subscription;
pub mod util;
pub mod webhook;

pub use card::{CardService, CardSyncCounts};
pub use charge::{Charge, ChargeEngine, NewCharge};
pub use client::{ProcessorError, ProcessorErrorKind, StripeClient};
pub use coupon::{Coupon, CouponService, NewCoupon};
pub use customer::{Customer, CustomerService};
pub use error::{BillingError, BillingResult};
pub use signals::{BillingSignal, SignalHub};
pub use source::{SourceRef, SourceRegistry, SourceResolver};
pub use subscription::{Subscription, SubscriptionPlan, SubscriptionService, TerminationReport};
pub use webhook::{WebhookEvent, WebhookProcessor, WebhookRejection};
