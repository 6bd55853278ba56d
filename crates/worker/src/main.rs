//! Payledger batch worker
//!
//! One-shot batch jobs driven from cron or an operator's shell. Each
//! invocation runs a single named job to completion and exits nonzero when
//! the job reports failures, so the scheduler can alert on it.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use payledger_billing::{
    ChargeEngine, CouponService, CustomerService, SignalHub, SourceRegistry, StripeClient,
    SubscriptionService, WebhookProcessor,
};
use payledger_shared::{create_pool, Config, Pacer};

mod jobs;

const USAGE: &str = "usage: payledger-worker <job>
jobs:
  charge-pending        push unpushed charges to stripe
  refresh-coupons       reconcile the local coupon mirror against stripe
  sync-cards            reconcile every customer's card mirror
  refresh-customers     refresh cached customer source fields from stripe
  end-subscriptions     cancel subscriptions whose end date has arrived
  check-pending-events  audit for webhook deliveries we never received";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(job) = args.next() else {
        bail!("{}", USAGE);
    };

    let config = Config::from_env().context("loading configuration")?;
    let pool = create_pool(&config.database_url)
        .await
        .context("connecting to database")?;
    let client = StripeClient::new(&config).context("building stripe client")?;
    let signals = SignalHub::new();
    let pacer = Pacer::new(config.batch_pace_ms);

    match job.as_str() {
        "charge-pending" => {
            let engine = ChargeEngine::new(
                client,
                pool.clone(),
                signals,
                Arc::new(SourceRegistry::new()),
            );
            jobs::charge_pending(&engine, &pool, &pacer).await
        }
        "refresh-coupons" => {
            let coupons = CouponService::new(client, pool);
            jobs::refresh_coupons(&coupons, &pacer).await
        }
        "sync-cards" => jobs::sync_cards(client, pool, &pacer).await,
        "refresh-customers" => {
            let customers = CustomerService::new(client, pool);
            jobs::refresh_customers(&customers, &pacer).await
        }
        "end-subscriptions" => {
            let subscriptions = SubscriptionService::new(client, pool);
            jobs::end_subscriptions(&subscriptions, &pacer).await
        }
        "check-pending-events" => {
            let processor = WebhookProcessor::new(client, pool, signals, &config);
            jobs::check_pending_events(&processor, &pacer).await
        }
        other => bail!("unknown job: {}\n{}", other, USAGE),
    }
}
