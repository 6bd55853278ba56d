//! Customer records
//!
//! A customer row is created from a Stripe.js tokenization response, then
//! promoted to a real Stripe customer exactly once. Rows are never hard
//! deleted; replacing a payment identity deactivates the old row and creates
//! a new one.

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use payledger_shared::Pacer;

use crate::client::{parse_object, CustomerObject, ProcessorErrorKind, StripeClient};
use crate::error::{BillingError, BillingResult};
use crate::util::retry_transient;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub is_active: bool,
    pub is_created_at_stripe: bool,
    /// Payment sources exactly as Stripe last returned them
    pub sources: Value,
    pub default_source: String,
    pub default_card_id: Option<Uuid>,
    pub stripe_js_response: Value,
    pub stripe_response: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Customer {
    pub async fn get(pool: &PgPool, id: Uuid) -> BillingResult<Self> {
        sqlx::query_as::<_, Customer>("SELECT * FROM stripe_customers WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))
    }

    /// Most recently created active customer for a user, or None.
    pub async fn latest_active_for_user(
        pool: &PgPool,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Customer>(
            "SELECT * FROM stripe_customers
             WHERE user_id = $1 AND is_active
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn get_by_remote_id(
        pool: &PgPool,
        stripe_customer_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Customer>(
            "SELECT * FROM stripe_customers WHERE stripe_customer_id = $1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(stripe_customer_id)
        .fetch_optional(pool)
        .await
    }

    /// The newest active, promoted customer of each user. One row per user,
    /// so batch sweeps make one pass per user.
    pub async fn active_promoted_per_user(pool: &PgPool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Customer>(
            "SELECT DISTINCT ON (user_id) *
             FROM stripe_customers
             WHERE is_active AND is_created_at_stripe
             ORDER BY user_id, created_at DESC, id DESC",
        )
        .fetch_all(pool)
        .await
    }
}

/// Registration and remote-sync operations on customer rows.
#[derive(Clone)]
pub struct CustomerService {
    client: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(client: StripeClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Record a fresh Stripe.js tokenization response for a user.
    ///
    /// Any previously active customer for the user is deactivated; the new
    /// row still has to be promoted with [`create_at_stripe`].
    ///
    /// [`create_at_stripe`]: CustomerService::create_at_stripe
    pub async fn register(&self, user_id: Uuid, stripe_js_response: Value) -> BillingResult<Customer> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE stripe_customers SET is_active = FALSE, updated_at = NOW()
             WHERE user_id = $1 AND is_active",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let customer = sqlx::query_as::<_, Customer>(
            "INSERT INTO stripe_customers (user_id, stripe_js_response)
             VALUES ($1, $2)
             RETURNING *",
        )
        .bind(user_id)
        .bind(&stripe_js_response)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(customer)
    }

    /// Promote a local row into a real Stripe customer. Fails when the row
    /// was already promoted.
    pub async fn create_at_stripe(
        &self,
        customer_id: Uuid,
        description: Option<&str>,
    ) -> BillingResult<Customer> {
        let customer = Customer::get(&self.pool, customer_id).await?;
        if customer.is_created_at_stripe {
            return Err(BillingError::AlreadyCreated);
        }

        let token = customer.stripe_js_response["id"]
            .as_str()
            .ok_or_else(|| {
                BillingError::Validation("stripe_js_response has no source token".into())
            })?
            .to_string();
        let description = match description {
            Some(d) => d.to_string(),
            None => format!("user {}", customer.user_id),
        };

        let (remote, raw) = self
            .client
            .create_customer(&token, &description)
            .await
            .map_err(wrap_processor)?;

        let customer = sqlx::query_as::<_, Customer>(
            "UPDATE stripe_customers
             SET stripe_customer_id = $2,
                 is_created_at_stripe = TRUE,
                 sources = $3,
                 default_source = $4,
                 stripe_response = $5,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(customer.id)
        .bind(&remote.id)
        .bind(sources_json(&remote))
        .bind(remote.default_source.as_deref().unwrap_or(""))
        .bind(&raw)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            customer_id = %customer.id,
            stripe_customer_id = %customer.stripe_customer_id,
            "created customer at stripe"
        );
        Ok(customer)
    }

    /// Attach a new payment source to an existing Stripe customer and make
    /// it the default, refreshing the cached source list from the response.
    pub async fn add_source(&self, customer_id: Uuid, source_token: &str) -> BillingResult<Customer> {
        let customer = Customer::get(&self.pool, customer_id).await?;
        if !customer.is_created_at_stripe {
            return Err(BillingError::Validation(
                "customer has not been created at stripe".into(),
            ));
        }

        let (remote, raw) = self
            .client
            .update_customer_source(&customer.stripe_customer_id, source_token)
            .await
            .map_err(wrap_processor)?;

        self.apply_remote(customer.id, &remote, &raw).await
    }

    /// Re-pull the remote customer and refresh the cached source fields.
    pub async fn refresh_from_stripe(&self, customer: &Customer) -> BillingResult<Customer> {
        let (remote, raw) = self
            .client
            .retrieve_customer(&customer.stripe_customer_id)
            .await
            .map_err(wrap_processor)?;
        self.apply_remote(customer.id, &remote, &raw).await
    }

    /// Mark a customer unusable for future charges without losing history.
    pub async fn deactivate(&self, customer_id: Uuid) -> BillingResult<Customer> {
        sqlx::query_as::<_, Customer>(
            "UPDATE stripe_customers SET is_active = FALSE, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::CustomerNotFound(customer_id.to_string()))
    }

    /// Walk Stripe's paginated customer list and refresh the cached source
    /// fields of every mirrored row. Returns the number of rows touched.
    pub async fn refresh_all_from_stripe(&self, pacer: &Pacer) -> BillingResult<usize> {
        let mut refreshed = 0usize;
        let mut cursor: Option<String> = None;

        loop {
            let page = retry_transient(|| self.client.list_customers(cursor.as_deref()))
                .await
                .map_err(wrap_processor)?;

            let mut last_id = None;
            for raw in &page.data {
                let remote: CustomerObject = parse_object(raw).map_err(wrap_processor)?;
                last_id = Some(remote.id.clone());
                if let Some(local) = Customer::get_by_remote_id(&self.pool, &remote.id).await? {
                    self.apply_remote(local.id, &remote, raw).await?;
                    refreshed += 1;
                }
            }

            if !page.has_more {
                break;
            }
            cursor = last_id;
            pacer.wait().await;
        }

        tracing::info!(refreshed, "customer refresh sweep finished");
        Ok(refreshed)
    }

    async fn apply_remote(
        &self,
        customer_id: Uuid,
        remote: &CustomerObject,
        raw: &Value,
    ) -> BillingResult<Customer> {
        let customer = sqlx::query_as::<_, Customer>(
            "UPDATE stripe_customers
             SET sources = $2,
                 default_source = $3,
                 stripe_response = $4,
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(customer_id)
        .bind(sources_json(remote))
        .bind(remote.default_source.as_deref().unwrap_or(""))
        .bind(raw)
        .fetch_one(&self.pool)
        .await?;
        Ok(customer)
    }
}

pub(crate) fn sources_json(remote: &CustomerObject) -> Value {
    match &remote.sources {
        Some(list) => Value::Array(list.data.clone()),
        None => Value::Array(Vec::new()),
    }
}

pub(crate) fn wrap_processor(error: crate::client::ProcessorError) -> BillingError {
    if error.kind == ProcessorErrorKind::Transient {
        BillingError::Transient(error)
    } else {
        BillingError::Processor(error)
    }
}
