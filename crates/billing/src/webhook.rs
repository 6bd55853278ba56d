//! Webhook ingestion
//!
//! Every delivery runs the same gauntlet: signature verification, then
//! dedup on the remote event id, then persist-and-dispatch. The event row
//! is written before any business logic runs, so a failed dispatch never
//! loses the payload; it is recorded as a parse error on the row instead.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;

use payledger_shared::{Config, Pacer};

use crate::card::CardService;
use crate::client::StripeClient;
use crate::coupon::{Coupon, CouponService};
use crate::customer::{wrap_processor, Customer};
use crate::error::{BillingError, BillingResult};
use crate::signals::{BillingSignal, SignalHub};
use crate::util::{retry_transient, timestamp_to_datetime};

type HmacSha256 = Hmac<Sha256>;

/// Hard stop for the pending-events audit when the local anchor is gone and
/// the remote list has to be walked page by page.
const EVENT_BACKLOG_PAGE_CAP: usize = 25;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEvent {
    /// Remote event id; doubles as the dedup key
    pub id: String,
    pub raw_data: Value,
    pub is_parsed: bool,
    pub parse_error: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Why a delivery was turned away at the door. All of these map to a 400.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookRejection {
    #[error("invalid payload")]
    InvalidPayload,

    #[error("invalid signature: {0}")]
    Signature(String),

    #[error("already received")]
    AlreadyReceived,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Rejected(#[from] WebhookRejection),

    #[error(transparent)]
    Internal(#[from] BillingError),
}

/// Payload that passed signature verification.
#[derive(Debug)]
pub struct VerifiedEvent {
    pub id: String,
    pub event_type: String,
    pub raw: Value,
}

/// Split `coupon.created` style event types on the last dot.
pub fn split_event_type(event_type: &str) -> (Option<&str>, Option<&str>) {
    match event_type.rsplit_once('.') {
        Some((model, action)) => (Some(model), Some(action)),
        None => (None, None),
    }
}

/// Receives, verifies, and dispatches Stripe webhook deliveries.
#[derive(Clone)]
pub struct WebhookProcessor {
    client: StripeClient,
    pool: PgPool,
    signals: SignalHub,
    cards: CardService,
    coupons: CouponService,
    webhook_secret: String,
    tolerance_secs: i64,
    pending_threshold: usize,
}

impl WebhookProcessor {
    pub fn new(client: StripeClient, pool: PgPool, signals: SignalHub, config: &Config) -> Self {
        Self {
            cards: CardService::new(client.clone(), pool.clone()),
            coupons: CouponService::new(client.clone(), pool.clone()),
            client,
            pool,
            signals,
            webhook_secret: config.stripe_webhook_secret.clone(),
            tolerance_secs: config.webhook_tolerance_secs,
            pending_threshold: config.pending_events_threshold,
        }
    }

    /// Verify the Stripe-Signature header against the raw body.
    pub fn verify(&self, body: &str, signature_header: &str) -> Result<VerifiedEvent, WebhookRejection> {
        self.verify_at(OffsetDateTime::now_utc().unix_timestamp(), body, signature_header)
    }

    fn verify_at(
        &self,
        now: i64,
        body: &str,
        signature_header: &str,
    ) -> Result<VerifiedEvent, WebhookRejection> {
        let mut timestamp: Option<i64> = None;
        let mut signature: Option<&str> = None;
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| WebhookRejection::Signature("missing timestamp".to_string()))?;
        let signature = signature
            .ok_or_else(|| WebhookRejection::Signature("missing v1 signature".to_string()))?;

        if (now - timestamp).abs() > self.tolerance_secs {
            return Err(WebhookRejection::Signature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let provided = hex::decode(signature)
            .map_err(|_| WebhookRejection::Signature("malformed signature".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| WebhookRejection::Signature("invalid webhook secret".to_string()))?;
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        // constant-time comparison
        mac.verify_slice(&provided)
            .map_err(|_| WebhookRejection::Signature("signature mismatch".to_string()))?;

        let raw: Value =
            serde_json::from_str(body).map_err(|_| WebhookRejection::InvalidPayload)?;
        let id = raw["id"]
            .as_str()
            .ok_or(WebhookRejection::InvalidPayload)?
            .to_string();
        let event_type = raw["type"]
            .as_str()
            .ok_or(WebhookRejection::InvalidPayload)?
            .to_string();

        Ok(VerifiedEvent {
            id,
            event_type,
            raw,
        })
    }

    /// Full ingestion path for one delivery: verify, dedup, persist,
    /// dispatch. The returned event carries any parse error that occurred
    /// during dispatch.
    pub async fn receive(
        &self,
        body: &str,
        signature_header: &str,
    ) -> Result<WebhookEvent, ReceiveError> {
        let verified = self.verify(body, signature_header)?;

        // the primary key is the dedup mechanism; a replay inserts nothing
        let inserted = sqlx::query_as::<_, WebhookEvent>(
            "INSERT INTO stripe_webhook_events (id, raw_data)
             VALUES ($1, $2)
             ON CONFLICT (id) DO NOTHING
             RETURNING *",
        )
        .bind(&verified.id)
        .bind(&verified.raw)
        .fetch_optional(&self.pool)
        .await
        .map_err(BillingError::from)?;

        if inserted.is_none() {
            // A replay of a fully processed event is refused. A replay of a
            // stored row that never finished dispatch (an earlier delivery
            // died on an infrastructure fault after the insert) gets to
            // finish the job; Stripe's redelivery is the retry mechanism.
            let existing = sqlx::query_as::<_, WebhookEvent>(
                "SELECT * FROM stripe_webhook_events WHERE id = $1",
            )
            .bind(&verified.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(BillingError::from)?;

            match existing {
                Some(event) if !event.is_parsed => {}
                _ => return Err(WebhookRejection::AlreadyReceived.into()),
            }
        }

        let event = self.parse(&verified.id).await?;
        Ok(event)
    }

    /// Dispatch a stored event's business effects and mark it parsed.
    ///
    /// Business failures are recorded on the row as `parse_error`;
    /// infrastructure failures (database, transient Stripe faults)
    /// propagate so the delivery can be retried.
    pub async fn parse(&self, event_id: &str) -> BillingResult<WebhookEvent> {
        let event = sqlx::query_as::<_, WebhookEvent>(
            "SELECT * FROM stripe_webhook_events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::Validation(format!("unknown webhook event: {}", event_id)))?;

        if event.is_parsed {
            return Err(BillingError::AlreadyParsed);
        }

        let event_type = event.raw_data["type"].as_str().unwrap_or_default().to_string();
        let (model, action) = split_event_type(&event_type);

        self.signals.emit(BillingSignal::WebhookPreParse {
            event_id: event.id.clone(),
            event_type: event_type.clone(),
            event_model: model.map(str::to_string),
            event_action: action.map(str::to_string),
        });

        let mut parse_error = String::new();
        if let (Some(model), Some(action)) = (model, action) {
            if let Err(error) = self.dispatch(model, action, &event.raw_data).await {
                match error {
                    BillingError::Database(_) | BillingError::Transient(_) => return Err(error),
                    business => {
                        tracing::warn!(
                            event_id = %event.id,
                            event_type = %event_type,
                            error = %business,
                            "webhook dispatch failed"
                        );
                        parse_error = business.to_string();
                    }
                }
            }
        }

        let event = sqlx::query_as::<_, WebhookEvent>(
            "UPDATE stripe_webhook_events
             SET is_parsed = TRUE, parse_error = $2, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(&event.id)
        .bind(&parse_error)
        .fetch_one(&self.pool)
        .await?;
        Ok(event)
    }

    async fn dispatch(&self, model: &str, action: &str, raw: &Value) -> BillingResult<()> {
        match model {
            "coupon" => self.handle_coupon(action, raw).await,
            "customer" | "customer.source" => self.handle_customer(model, action, raw).await,
            "charge.dispute" => {
                tracing::warn!(
                    charge = raw["data"]["object"]["charge"].as_str().unwrap_or(""),
                    action,
                    "charge dispute event received"
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_coupon(&self, action: &str, raw: &Value) -> BillingResult<()> {
        let object = &raw["data"]["object"];
        let coupon_id = object["id"]
            .as_str()
            .ok_or_else(|| BillingError::Validation("coupon event without id".into()))?;
        let created = object["created"]
            .as_i64()
            .map(timestamp_to_datetime)
            .ok_or_else(|| {
                BillingError::Validation("coupon event without creation timestamp".into())
            })?;

        match action {
            "created" => {
                if Coupon::identity_exists(&self.pool, coupon_id, created).await? {
                    return Err(BillingError::CouponAlreadyExists);
                }
                self.coupons.create_from_remote(coupon_id).await?;
                Ok(())
            }
            "updated" => {
                if let Some(local) =
                    Coupon::find_live_by_identity(&self.pool, coupon_id, created).await?
                {
                    let metadata = object["metadata"].clone();
                    sqlx::query(
                        "UPDATE stripe_coupons
                         SET metadata = $2, updated_at = NOW()
                         WHERE id = $1",
                    )
                    .bind(local.id)
                    .bind(&metadata)
                    .execute(&self.pool)
                    .await?;
                }
                Ok(())
            }
            "deleted" => {
                // local-only; the remote side is already gone
                self.coupons
                    .soft_delete_by_identity(coupon_id, created)
                    .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn handle_customer(&self, model: &str, action: &str, raw: &Value) -> BillingResult<()> {
        if action != "updated" {
            return Ok(());
        }

        let object = &raw["data"]["object"];
        let remote_customer_id = if model == "customer.source" {
            object["customer"].as_str()
        } else {
            object["id"].as_str()
        }
        .ok_or_else(|| BillingError::Validation("customer event without customer id".into()))?;

        let Some(customer) = Customer::get_by_remote_id(&self.pool, remote_customer_id).await?
        else {
            tracing::warn!(
                stripe_customer_id = remote_customer_id,
                "customer event for unknown customer"
            );
            return Ok(());
        };

        match self.cards.sync_customer(&customer).await {
            Ok(_counts) => Ok(()),
            Err(error @ BillingError::Database(_)) => Err(error),
            Err(error) => {
                // a broken remote fetch must not fail the delivery
                tracing::warn!(
                    customer_id = %customer.id,
                    %error,
                    "cannot refresh customer from webhook"
                );
                Ok(())
            }
        }
    }

    /// Audit for dropped deliveries: count remote events newer than the
    /// newest event we ingested and fail when the backlog crosses the
    /// alert threshold.
    pub async fn check_pending_events(&self, pacer: &Pacer) -> BillingResult<usize> {
        let newest: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM stripe_webhook_events ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        // an anchor Stripe no longer knows forces a bounded full walk
        let mut anchor = newest.map(|(id,)| id);
        if let Some(id) = &anchor {
            match self.client.retrieve_event(id).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => anchor = None,
                Err(error) => return Err(wrap_processor(error)),
            }
        }

        let mut pending = 0usize;
        let mut pages = 0usize;
        let mut cursor = anchor;

        loop {
            let page = retry_transient(|| self.client.list_events(cursor.as_deref()))
                .await
                .map_err(wrap_processor)?;

            pending += page.data.len();
            if pending > self.pending_threshold {
                return Err(BillingError::PendingEventsThreshold {
                    pending,
                    threshold: self.pending_threshold,
                });
            }
            if !page.has_more {
                break;
            }

            pages += 1;
            if pages >= EVENT_BACKLOG_PAGE_CAP {
                return Err(BillingError::PendingEventsThreshold {
                    pending,
                    threshold: self.pending_threshold,
                });
            }
            cursor = page
                .data
                .last()
                .and_then(|e| e["id"].as_str().map(str::to_string));
            pacer.wait().await;
        }

        tracing::info!(pending, "pending webhook events within threshold");
        Ok(pending)
    }
}
