//! Batch job implementations
//!
//! Every job isolates per-item failures: one bad record is logged and
//! counted, the loop moves on, and the job as a whole fails only at the end
//! if anything failed. Remote calls inside loops go through the shared
//! pacer.

use anyhow::{bail, Result};
use sqlx::PgPool;
use tracing::{error, info, warn};

use payledger_billing::{
    BillingError, CardService, CardSyncCounts, Charge, ChargeEngine, CouponService, Customer,
    CustomerService, StripeClient, SubscriptionService, WebhookProcessor,
};
use payledger_shared::Pacer;

const MAX_TRANSIENT_ATTEMPTS: usize = 5;

/// Push every unpushed, non-manual charge to Stripe.
///
/// The idempotency seed is the charge's creation timestamp, so re-running
/// the job can never double-bill a charge it already pushed.
pub async fn charge_pending(engine: &ChargeEngine, pool: &PgPool, pacer: &Pacer) -> Result<()> {
    let pending = Charge::pending(pool).await?;
    info!(count = pending.len(), "pushing pending charges");

    let mut failed = 0usize;
    for charge in pending {
        let seed = charge.created_at.unix_timestamp().to_string();
        let mut attempts = 0usize;
        loop {
            match engine.charge(charge.id, &seed).await {
                // None covers both "no active customer" and a recorded
                // decline; neither is a job failure
                Ok(_) => break,
                Err(BillingError::AlreadyCharged) => break,
                Err(e) if e.is_retryable() && attempts + 1 < MAX_TRANSIENT_ATTEMPTS => {
                    attempts += 1;
                    warn!(charge_id = %charge.id, attempt = attempts, "transient fault, retrying");
                    pacer.wait().await;
                }
                Err(e) => {
                    error!(charge_id = %charge.id, error = %e, "charge failed");
                    failed += 1;
                    break;
                }
            }
        }
        pacer.wait().await;
    }

    if failed > 0 {
        bail!("{} charges failed", failed);
    }
    Ok(())
}

/// Full coupon reconciliation sweep.
pub async fn refresh_coupons(coupons: &CouponService, pacer: &Pacer) -> Result<()> {
    let counts = coupons.reconcile(pacer).await?;
    info!(
        created = counts.created,
        updated = counts.updated,
        deleted = counts.deleted,
        "coupon sweep done"
    );
    Ok(())
}

/// Reconcile the card mirror of each user's current active customer.
pub async fn sync_cards(client: StripeClient, pool: PgPool, pacer: &Pacer) -> Result<()> {
    let cards = CardService::new(client, pool.clone());
    let customers = Customer::active_promoted_per_user(&pool).await?;
    info!(count = customers.len(), "syncing customer cards");

    let mut totals = CardSyncCounts::default();
    let mut failed = 0usize;
    for customer in customers {
        match cards.sync_customer(&customer).await {
            Ok(counts) => {
                totals.created += counts.created;
                totals.updated += counts.updated;
                totals.deleted += counts.deleted;
            }
            Err(e) => {
                error!(customer_id = %customer.id, error = %e, "card sync failed");
                failed += 1;
            }
        }
        pacer.wait().await;
    }

    info!(
        created = totals.created,
        updated = totals.updated,
        deleted = totals.deleted,
        failed,
        "card sync done"
    );
    if failed > 0 {
        bail!("card sync failed for {} customers", failed);
    }
    Ok(())
}

/// Refresh cached customer source fields from Stripe's customer list.
pub async fn refresh_customers(customers: &CustomerService, pacer: &Pacer) -> Result<()> {
    let refreshed = customers.refresh_all_from_stripe(pacer).await?;
    info!(refreshed, "customer refresh done");
    Ok(())
}

/// Cancel, at the period end, every active subscription whose end date
/// falls within the next hour.
pub async fn end_subscriptions(subscriptions: &SubscriptionService, pacer: &Pacer) -> Result<()> {
    let report = subscriptions.end_due_subscriptions(pacer).await?;
    if !report.all_succeeded() {
        for (id, reason) in &report.failed {
            error!(subscription_id = %id, reason = %reason, "subscription not ended");
        }
        bail!(
            "{} of {} subscriptions failed to end",
            report.failed.len(),
            report.attempted
        );
    }
    info!(attempted = report.attempted, "subscription termination done");
    Ok(())
}

/// Alert when Stripe holds events we never ingested.
pub async fn check_pending_events(processor: &WebhookProcessor, pacer: &Pacer) -> Result<()> {
    let pending = processor.check_pending_events(pacer).await?;
    info!(pending, "pending event audit done");
    Ok(())
}
