//! Subscription plans and lifecycle
//!
//! Plans and subscriptions are created locally first and pushed to Stripe
//! exactly once. Cancellation always refreshes from Stripe before deciding
//! anything, and the nightly termination batch isolates per-item failures so
//! one bad subscription cannot stall the rest.

use serde_json::Value;
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use payledger_shared::Pacer;

use crate::client::{PlanParams, StripeClient, SubscriptionObject, SubscriptionParams};
use crate::coupon::Coupon;
use crate::customer::{wrap_processor, Customer};
use crate::error::{BillingError, BillingResult};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_CANCELED: &str = "canceled";

/// Subscriptions ending within this window are picked up by the
/// termination batch.
const TERMINATION_LOOKAHEAD: Duration = Duration::hours(1);

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub stripe_plan_id: String,
    pub name: String,
    pub amount: i64,
    pub currency: String,
    pub interval: String,
    pub interval_count: i32,
    pub trial_period_days: i32,
    pub statement_descriptor: String,
    pub metadata: Value,
    pub is_created_at_stripe: bool,
    pub stripe_response: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionPlan {
    pub async fn get(pool: &PgPool, id: Uuid) -> BillingResult<Self> {
        sqlx::query_as::<_, SubscriptionPlan>(
            "SELECT * FROM stripe_subscription_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BillingError::SubscriptionNotFound(format!("plan {}", id)))
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub coupon_id: Option<Uuid>,
    pub stripe_subscription_id: String,
    pub status: String,
    pub tax_percent: f64,
    pub metadata: Value,
    pub end_date: Option<Date>,
    pub canceled_at: Option<OffsetDateTime>,
    pub at_period_end: bool,
    pub is_created_at_stripe: bool,
    pub stripe_response: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub async fn get(pool: &PgPool, id: Uuid) -> BillingResult<Self> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM stripe_subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }
}

/// Outcome of one termination batch run.
#[derive(Debug, Default)]
pub struct TerminationReport {
    pub attempted: usize,
    pub failed: Vec<(Uuid, String)>,
}

impl TerminationReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Plan and subscription operations against Stripe.
#[derive(Clone)]
pub struct SubscriptionService {
    client: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(client: StripeClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Push a local plan to Stripe, using the local row id as the remote
    /// plan id.
    pub async fn create_plan_at_stripe(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        let plan = SubscriptionPlan::get(&self.pool, plan_id).await?;
        if plan.is_created_at_stripe {
            return Err(BillingError::AlreadyCreated);
        }

        let remote_plan_id = plan.id.to_string();
        let params = PlanParams {
            plan_id: &remote_plan_id,
            amount: plan.amount,
            currency: &plan.currency,
            interval: &plan.interval,
            interval_count: plan.interval_count,
            name: &plan.name,
            statement_descriptor: if plan.statement_descriptor.is_empty() {
                None
            } else {
                Some(&plan.statement_descriptor)
            },
            trial_period_days: plan.trial_period_days,
            metadata: plan.metadata.clone(),
        };
        let (remote, raw) = self
            .client
            .create_plan(&params)
            .await
            .map_err(wrap_processor)?;

        let plan = sqlx::query_as::<_, SubscriptionPlan>(
            "UPDATE stripe_subscription_plans
             SET stripe_plan_id = $2, is_created_at_stripe = TRUE,
                 stripe_response = $3, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(plan.id)
        .bind(&remote.id)
        .bind(&raw)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(plan_id = %plan.id, stripe_plan_id = %plan.stripe_plan_id, "created plan at stripe");
        Ok(plan)
    }

    /// Push a local subscription to Stripe. Skipped silently when the user
    /// has no active customer; a processor fault leaves the row eligible
    /// for another attempt.
    pub async fn create_at_stripe(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let subscription = Subscription::get(&self.pool, subscription_id).await?;
        if subscription.is_created_at_stripe {
            return Err(BillingError::AlreadyCreated);
        }

        let Some(customer) =
            Customer::latest_active_for_user(&self.pool, subscription.user_id).await?
        else {
            tracing::info!(
                subscription_id = %subscription.id,
                user_id = %subscription.user_id,
                "no active customer, skipping subscription creation"
            );
            return Ok(None);
        };

        let plan = SubscriptionPlan::get(&self.pool, subscription.plan_id).await?;
        if !plan.is_created_at_stripe {
            return Err(BillingError::Validation(
                "plan has not been created at stripe".into(),
            ));
        }

        let coupon_code = match subscription.coupon_id {
            Some(coupon_id) => Some(Coupon::get(&self.pool, coupon_id).await?.coupon_id),
            None => None,
        };

        let params = SubscriptionParams {
            customer: &customer.stripe_customer_id,
            plan: &plan.stripe_plan_id,
            tax_percent: subscription.tax_percent,
            coupon: coupon_code.as_deref(),
            metadata: subscription.metadata.clone(),
        };
        let (remote, raw) = self
            .client
            .create_subscription(&params)
            .await
            .map_err(wrap_processor)?;

        let subscription = self
            .apply_remote(&subscription, &customer, &remote, &raw)
            .await?;
        tracing::info!(
            subscription_id = %subscription.id,
            stripe_subscription_id = %subscription.stripe_subscription_id,
            status = %subscription.status,
            "created subscription at stripe"
        );
        Ok(Some(subscription))
    }

    /// Re-pull the remote subscription and mirror its status.
    pub async fn refresh_from_stripe(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<(Subscription, SubscriptionObject)> {
        let (remote, raw) = self
            .client
            .retrieve_subscription(&subscription.stripe_subscription_id)
            .await
            .map_err(wrap_processor)?;

        let updated = sqlx::query_as::<_, Subscription>(
            "UPDATE stripe_subscriptions
             SET status = $2, stripe_response = $3, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(subscription.id)
        .bind(&remote.status)
        .bind(&raw)
        .fetch_one(&self.pool)
        .await?;
        Ok((updated, remote))
    }

    /// Cancel a subscription, immediately or at the period end.
    ///
    /// Remote state is refreshed first; a subscription Stripe already shows
    /// as canceled is left to the webhook flow rather than canceled twice.
    /// Local state changes only when the cancel response confirms it.
    pub async fn cancel(&self, subscription_id: Uuid, at_period_end: bool) -> BillingResult<Subscription> {
        let subscription = Subscription::get(&self.pool, subscription_id).await?;
        if !subscription.is_created_at_stripe {
            return Err(BillingError::Validation(
                "subscription has not been created at stripe".into(),
            ));
        }

        let (subscription, remote) = self.refresh_from_stripe(&subscription).await?;
        if remote.status == STATUS_CANCELED {
            return Ok(subscription);
        }

        let (canceled, raw) = self
            .client
            .cancel_subscription(&subscription.stripe_subscription_id, at_period_end)
            .await
            .map_err(wrap_processor)?;

        if canceled.status != STATUS_CANCELED && !canceled.cancel_at_period_end {
            return Ok(subscription);
        }

        let subscription = sqlx::query_as::<_, Subscription>(
            "UPDATE stripe_subscriptions
             SET status = $2, canceled_at = NOW(), at_period_end = $3,
                 stripe_response = $4, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(subscription.id)
        .bind(STATUS_CANCELED)
        .bind(at_period_end)
        .bind(&raw)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            at_period_end,
            "subscription canceled"
        );
        Ok(subscription)
    }

    /// Cancel every active subscription whose end date falls within the
    /// next hour, at the period end, pacing the remote calls. Failures are
    /// collected per item and reported together.
    pub async fn end_due_subscriptions(&self, pacer: &Pacer) -> BillingResult<TerminationReport> {
        let cutoff = (OffsetDateTime::now_utc() + TERMINATION_LOOKAHEAD).date();
        let due = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM stripe_subscriptions
             WHERE status = $1 AND end_date IS NOT NULL AND end_date <= $2
             ORDER BY end_date",
        )
        .bind(STATUS_ACTIVE)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut report = TerminationReport::default();
        for subscription in due {
            report.attempted += 1;
            if let Err(error) = self.cancel(subscription.id, true).await {
                tracing::error!(
                    subscription_id = %subscription.id,
                    %error,
                    "failed to end subscription"
                );
                report.failed.push((subscription.id, error.to_string()));
            }
            pacer.wait().await;
        }

        tracing::info!(
            attempted = report.attempted,
            failed = report.failed.len(),
            "subscription termination batch finished"
        );
        Ok(report)
    }

    async fn apply_remote(
        &self,
        subscription: &Subscription,
        customer: &Customer,
        remote: &SubscriptionObject,
        raw: &Value,
    ) -> BillingResult<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "UPDATE stripe_subscriptions
             SET customer_id = $2, stripe_subscription_id = $3, status = $4,
                 is_created_at_stripe = TRUE, stripe_response = $5, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(subscription.id)
        .bind(customer.id)
        .bind(&remote.id)
        .bind(&remote.status)
        .bind(raw)
        .fetch_one(&self.pool)
        .await?;
        Ok(subscription)
    }
}
