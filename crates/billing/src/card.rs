//! Card mirror and reconciliation
//!
//! Local card rows mirror the customer's remote card list. Reconciliation is
//! set algebra over remote ids versus local active and soft-deleted ids; a
//! second run against unchanged remote state performs zero writes.

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{parse_object, CardObject, StripeClient};
use crate::customer::{sources_json, wrap_processor, Customer};
use crate::error::BillingResult;
use crate::util::retry_transient;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Card {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub stripe_card_id: String,
    pub last4: String,
    pub exp_month: i32,
    pub exp_year: i32,
    pub is_deleted: bool,
    pub stripe_response: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Card {
    pub async fn active_for_customer(
        pool: &PgPool,
        customer_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Card>(
            "SELECT * FROM stripe_cards WHERE customer_id = $1 AND NOT is_deleted",
        )
        .bind(customer_id)
        .fetch_all(pool)
        .await
    }

    pub async fn deleted_for_customer(
        pool: &PgPool,
        customer_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Card>(
            "SELECT * FROM stripe_cards WHERE customer_id = $1 AND is_deleted",
        )
        .bind(customer_id)
        .fetch_all(pool)
        .await
    }
}

/// Remote card as returned by Stripe: typed view plus the raw body.
#[derive(Debug, Clone)]
pub struct RemoteCard {
    pub card: CardObject,
    pub raw: Value,
}

/// Writes a reconciliation run decided on.
#[derive(Debug, Default)]
pub struct CardSyncPlan<'a> {
    pub create: Vec<&'a RemoteCard>,
    pub soft_delete: Vec<&'a Card>,
    pub restore: Vec<(&'a Card, &'a RemoteCard)>,
    pub update: Vec<(&'a Card, &'a RemoteCard)>,
}

impl CardSyncPlan<'_> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.soft_delete.is_empty()
            && self.restore.is_empty()
            && self.update.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CardSyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

fn fields_differ(local: &Card, remote: &CardObject) -> bool {
    local.last4 != remote.last4
        || local.exp_month != remote.exp_month
        || local.exp_year != remote.exp_year
}

/// Pure diff between the remote card list and local state.
///
/// remote minus local becomes creates, local-active minus remote becomes
/// soft deletes, remote intersect local-deleted becomes restores, and
/// remote intersect local-active becomes updates only when a mirrored field
/// actually changed.
pub fn diff_cards<'a>(
    remote: &'a [RemoteCard],
    active: &'a [Card],
    deleted: &'a [Card],
) -> CardSyncPlan<'a> {
    let mut plan = CardSyncPlan::default();

    for remote_card in remote {
        let remote_id = remote_card.card.id.as_str();
        if let Some(local) = active.iter().find(|c| c.stripe_card_id == remote_id) {
            if fields_differ(local, &remote_card.card) {
                plan.update.push((local, remote_card));
            }
        } else if let Some(local) = deleted.iter().find(|c| c.stripe_card_id == remote_id) {
            plan.restore.push((local, remote_card));
        } else {
            plan.create.push(remote_card);
        }
    }

    for local in active {
        if !remote.iter().any(|r| r.card.id == local.stripe_card_id) {
            plan.soft_delete.push(local);
        }
    }

    plan
}

/// Reconciles one customer's cards against Stripe.
#[derive(Clone)]
pub struct CardService {
    client: StripeClient,
    pool: PgPool,
}

impl CardService {
    pub fn new(client: StripeClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Full reconciliation for one customer: refresh the cached source list,
    /// apply the card diff, and repoint the default card if Stripe moved it.
    pub async fn sync_customer(&self, customer: &Customer) -> BillingResult<CardSyncCounts> {
        let (remote_customer, _raw) = self
            .client
            .retrieve_customer(&customer.stripe_customer_id)
            .await
            .map_err(wrap_processor)?;

        let remote_cards = self.fetch_all_cards(&customer.stripe_customer_id).await?;
        let active = Card::active_for_customer(&self.pool, customer.id).await?;
        let deleted = Card::deleted_for_customer(&self.pool, customer.id).await?;

        let plan = diff_cards(&remote_cards, &active, &deleted);
        let counts = self.apply(customer, &plan).await?;

        self.repoint_default(customer, remote_customer.default_source.as_deref())
            .await?;
        self.refresh_source_cache(customer, &remote_customer).await?;

        if counts != CardSyncCounts::default() {
            tracing::info!(
                customer_id = %customer.id,
                created = counts.created,
                updated = counts.updated,
                deleted = counts.deleted,
                "card sync applied changes"
            );
        }
        Ok(counts)
    }

    async fn fetch_all_cards(&self, stripe_customer_id: &str) -> BillingResult<Vec<RemoteCard>> {
        let mut cards = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = retry_transient(|| {
                self.client
                    .list_customer_cards(stripe_customer_id, cursor.as_deref())
            })
            .await
            .map_err(wrap_processor)?;
            for raw in page.data {
                let card: CardObject = parse_object(&raw).map_err(wrap_processor)?;
                cards.push(RemoteCard { card, raw });
            }
            if !page.has_more {
                break;
            }
            cursor = cards.last().map(|c| c.card.id.clone());
        }
        Ok(cards)
    }

    async fn apply(&self, customer: &Customer, plan: &CardSyncPlan<'_>) -> BillingResult<CardSyncCounts> {
        let mut counts = CardSyncCounts::default();
        if plan.is_empty() {
            return Ok(counts);
        }

        let mut tx = self.pool.begin().await?;

        for remote in &plan.create {
            sqlx::query(
                "INSERT INTO stripe_cards
                     (customer_id, stripe_card_id, last4, exp_month, exp_year, stripe_response)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(customer.id)
            .bind(&remote.card.id)
            .bind(&remote.card.last4)
            .bind(remote.card.exp_month)
            .bind(remote.card.exp_year)
            .bind(&remote.raw)
            .execute(&mut *tx)
            .await?;
            counts.created += 1;
        }

        for (local, remote) in &plan.update {
            sqlx::query(
                "UPDATE stripe_cards
                 SET last4 = $2, exp_month = $3, exp_year = $4,
                     stripe_response = $5, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(local.id)
            .bind(&remote.card.last4)
            .bind(remote.card.exp_month)
            .bind(remote.card.exp_year)
            .bind(&remote.raw)
            .execute(&mut *tx)
            .await?;
            counts.updated += 1;
        }

        for (local, remote) in &plan.restore {
            sqlx::query(
                "UPDATE stripe_cards
                 SET is_deleted = FALSE, last4 = $2, exp_month = $3, exp_year = $4,
                     stripe_response = $5, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(local.id)
            .bind(&remote.card.last4)
            .bind(remote.card.exp_month)
            .bind(remote.card.exp_year)
            .bind(&remote.raw)
            .execute(&mut *tx)
            .await?;
            counts.updated += 1;
        }

        for local in &plan.soft_delete {
            sqlx::query(
                "UPDATE stripe_cards SET is_deleted = TRUE, updated_at = NOW() WHERE id = $1",
            )
            .bind(local.id)
            .execute(&mut *tx)
            .await?;
            counts.deleted += 1;
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Point the customer's default card at the live row mirroring Stripe's
    /// default source. No write when already in agreement.
    async fn repoint_default(
        &self,
        customer: &Customer,
        remote_default: Option<&str>,
    ) -> BillingResult<()> {
        let Some(remote_default) = remote_default else {
            return Ok(());
        };

        let target: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM stripe_cards
             WHERE customer_id = $1 AND stripe_card_id = $2 AND NOT is_deleted",
        )
        .bind(customer.id)
        .bind(remote_default)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((card_id,)) = target {
            if customer.default_card_id != Some(card_id) {
                sqlx::query(
                    "UPDATE stripe_customers
                     SET default_card_id = $2, updated_at = NOW()
                     WHERE id = $1",
                )
                .bind(customer.id)
                .bind(card_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn refresh_source_cache(
        &self,
        customer: &Customer,
        remote: &crate::client::CustomerObject,
    ) -> BillingResult<()> {
        let sources = sources_json(remote);
        let default_source = remote.default_source.as_deref().unwrap_or("");
        if customer.sources == sources && customer.default_source == default_source {
            return Ok(());
        }

        sqlx::query(
            "UPDATE stripe_customers
             SET sources = $2, default_source = $3, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(customer.id)
        .bind(&sources)
        .bind(default_source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
