//! Coupon mirror
//!
//! Stripe deletes coupons for real and reuses ids, so the local identity of
//! a coupon is the `(coupon_id, coupon_created)` pair and rows are only ever
//! soft-deleted. A partial unique index keeps at most one live row per
//! coupon id; racing creates lose at the constraint, not in application
//! code.

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use payledger_shared::Pacer;

use crate::client::{parse_object, CouponObject, CouponParams, StripeClient};
use crate::customer::wrap_processor;
use crate::error::{BillingError, BillingResult};
use crate::util::{retry_transient, timestamp_to_datetime};

pub const DURATION_FOREVER: &str = "forever";
pub const DURATION_ONCE: &str = "once";
pub const DURATION_REPEATING: &str = "repeating";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Coupon {
    pub id: Uuid,
    /// Stripe coupon id; unique among live rows only
    pub coupon_id: String,
    pub amount_off: Option<i64>,
    pub percent_off: Option<f64>,
    pub currency: Option<String>,
    pub duration: String,
    pub duration_in_months: Option<i32>,
    pub max_redemptions: Option<i32>,
    pub times_redeemed: i32,
    pub redeem_by: Option<OffsetDateTime>,
    pub livemode: bool,
    pub valid: bool,
    pub metadata: Value,
    /// Stripe's creation timestamp, the second half of the identity
    pub coupon_created: OffsetDateTime,
    pub is_deleted: bool,
    pub is_created_at_stripe: bool,
    pub stripe_response: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Coupon {
    pub async fn get(pool: &PgPool, id: Uuid) -> BillingResult<Self> {
        sqlx::query_as::<_, Coupon>(
            "SELECT * FROM stripe_coupons WHERE id = $1 AND NOT is_deleted",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BillingError::CouponNotFound(id.to_string()))
    }

    /// Live row matching the full remote identity, if any.
    pub async fn find_live_by_identity(
        pool: &PgPool,
        coupon_id: &str,
        coupon_created: OffsetDateTime,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Coupon>(
            "SELECT * FROM stripe_coupons
             WHERE coupon_id = $1 AND coupon_created = $2 AND NOT is_deleted",
        )
        .bind(coupon_id)
        .bind(coupon_created)
        .fetch_optional(pool)
        .await
    }

    /// Any row, soft-deleted included, matching the full remote identity.
    pub async fn identity_exists(
        pool: &PgPool,
        coupon_id: &str,
        coupon_created: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM stripe_coupons
                 WHERE coupon_id = $1 AND coupon_created = $2
             )",
        )
        .bind(coupon_id)
        .bind(coupon_created)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }
}

/// Fields for creating a new coupon at Stripe.
#[derive(Debug, Clone, Default)]
pub struct NewCoupon {
    /// None lets Stripe generate an id
    pub coupon_id: Option<String>,
    pub duration: String,
    pub amount_off: Option<i64>,
    pub percent_off: Option<f64>,
    pub currency: Option<String>,
    pub duration_in_months: Option<i32>,
    pub max_redemptions: Option<i32>,
    pub redeem_by: Option<OffsetDateTime>,
    pub metadata: Value,
}

/// Discount and duration consistency rules, checked before any remote call.
pub fn validate_new_coupon(new: &NewCoupon) -> BillingResult<()> {
    match (new.amount_off, new.percent_off) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(BillingError::Validation(
                "exactly one of amount_off and percent_off is required".into(),
            ));
        }
        _ => {}
    }
    if new.amount_off.is_some() && new.currency.is_none() {
        return Err(BillingError::Validation(
            "amount_off requires a currency".into(),
        ));
    }
    match new.duration.as_str() {
        DURATION_REPEATING => {
            if new.duration_in_months.is_none() {
                return Err(BillingError::Validation(
                    "repeating coupons require duration_in_months".into(),
                ));
            }
        }
        DURATION_FOREVER | DURATION_ONCE => {
            if new.duration_in_months.is_some() {
                return Err(BillingError::Validation(
                    "duration_in_months is only valid for repeating coupons".into(),
                ));
            }
        }
        other => {
            return Err(BillingError::Validation(format!(
                "unknown coupon duration: {}",
                other
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CouponSyncCounts {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Coupon lifecycle against Stripe plus the reconciliation sweep.
#[derive(Clone)]
pub struct CouponService {
    client: StripeClient,
    pool: PgPool,
}

impl CouponService {
    pub fn new(client: StripeClient, pool: PgPool) -> Self {
        Self { client, pool }
    }

    /// Create the coupon at Stripe first, then mirror it locally.
    pub async fn create(&self, new: NewCoupon) -> BillingResult<Coupon> {
        validate_new_coupon(&new)?;

        let params = CouponParams {
            coupon_id: new.coupon_id.as_deref(),
            duration: &new.duration,
            amount_off: new.amount_off,
            currency: new.currency.as_deref(),
            duration_in_months: new.duration_in_months,
            max_redemptions: new.max_redemptions.map(i64::from),
            percent_off: new.percent_off,
            redeem_by: new.redeem_by.map(|t| t.unix_timestamp()),
            metadata: new.metadata.clone(),
        };
        let (remote, raw) = self
            .client
            .create_coupon(&params)
            .await
            .map_err(wrap_processor)?;

        self.insert_from_remote(&remote, &raw, true).await
    }

    /// Mirror a coupon that already exists at Stripe, typically on a
    /// `coupon.created` webhook. Older live rows with the same id are
    /// soft-deleted; a racing duplicate loses at the unique index.
    pub async fn create_from_remote(&self, coupon_id: &str) -> BillingResult<Coupon> {
        let (remote, raw) = match self.client.retrieve_coupon(coupon_id).await {
            Ok(pair) => pair,
            Err(error) if error.is_not_found() => {
                return Err(BillingError::CouponNotFound(coupon_id.to_string()));
            }
            Err(error) => return Err(wrap_processor(error)),
        };

        let coupon_created = timestamp_to_datetime(remote.created);
        if Coupon::identity_exists(&self.pool, coupon_id, coupon_created).await? {
            return Err(BillingError::CouponAlreadyExists);
        }

        sqlx::query(
            "UPDATE stripe_coupons SET is_deleted = TRUE, updated_at = NOW()
             WHERE coupon_id = $1 AND NOT is_deleted",
        )
        .bind(coupon_id)
        .execute(&self.pool)
        .await?;

        self.insert_from_remote(&remote, &raw, false).await
    }

    /// Push new metadata to Stripe and mirror the result. Metadata is the
    /// only coupon field Stripe allows to change in place.
    pub async fn update_metadata(&self, id: Uuid, metadata: Value) -> BillingResult<Coupon> {
        let coupon = Coupon::get(&self.pool, id).await?;
        let (_remote, raw) = self
            .client
            .update_coupon_metadata(&coupon.coupon_id, &metadata)
            .await
            .map_err(wrap_processor)?;

        let coupon = sqlx::query_as::<_, Coupon>(
            "UPDATE stripe_coupons
             SET metadata = $2, stripe_response = $3, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(coupon.id)
        .bind(&metadata)
        .bind(&raw)
        .fetch_one(&self.pool)
        .await?;
        Ok(coupon)
    }

    /// Soft-delete locally; delete at Stripe only when the remote coupon is
    /// the same incarnation we mirror. Remote absence is not an error.
    pub async fn delete(&self, id: Uuid) -> BillingResult<Coupon> {
        let coupon = Coupon::get(&self.pool, id).await?;

        match self.client.retrieve_coupon(&coupon.coupon_id).await {
            Ok((remote, _raw)) => {
                if timestamp_to_datetime(remote.created) == coupon.coupon_created {
                    if let Err(error) = self.client.delete_coupon(&coupon.coupon_id).await {
                        if !error.is_not_found() {
                            return Err(wrap_processor(error));
                        }
                    }
                }
            }
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(wrap_processor(error)),
        }

        let coupon = sqlx::query_as::<_, Coupon>(
            "UPDATE stripe_coupons SET is_deleted = TRUE, updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(coupon.id)
        .fetch_one(&self.pool)
        .await?;
        Ok(coupon)
    }

    /// Soft-delete the live row matching a remote identity without touching
    /// Stripe. Used when Stripe reports the deletion itself.
    pub async fn soft_delete_by_identity(
        &self,
        coupon_id: &str,
        coupon_created: OffsetDateTime,
    ) -> BillingResult<bool> {
        let rows = sqlx::query(
            "UPDATE stripe_coupons SET is_deleted = TRUE, updated_at = NOW()
             WHERE coupon_id = $1 AND coupon_created = $2 AND NOT is_deleted",
        )
        .bind(coupon_id)
        .bind(coupon_created)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Full sweep against Stripe's coupon list: page through every remote
    /// coupon, upsert each, then soft-delete every live row the sweep did
    /// not touch.
    pub async fn reconcile(&self, pacer: &Pacer) -> BillingResult<CouponSyncCounts> {
        let mut counts = CouponSyncCounts::default();
        let mut seen: Vec<Uuid> = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = retry_transient(|| self.client.list_coupons(cursor.as_deref()))
                .await
                .map_err(wrap_processor)?;

            let mut last_id = None;
            for raw in &page.data {
                let remote: CouponObject = parse_object(raw).map_err(wrap_processor)?;
                last_id = Some(remote.id.clone());
                let coupon_created = timestamp_to_datetime(remote.created);

                match Coupon::find_live_by_identity(&self.pool, &remote.id, coupon_created).await? {
                    Some(local) => {
                        self.apply_remote_fields(&local, &remote, raw).await?;
                        counts.updated += 1;
                        seen.push(local.id);
                    }
                    None => {
                        sqlx::query(
                            "UPDATE stripe_coupons SET is_deleted = TRUE, updated_at = NOW()
                             WHERE coupon_id = $1 AND NOT is_deleted",
                        )
                        .bind(&remote.id)
                        .execute(&self.pool)
                        .await?;
                        let created = self.insert_from_remote(&remote, raw, false).await?;
                        counts.created += 1;
                        seen.push(created.id);
                    }
                }
            }

            if !page.has_more {
                break;
            }
            cursor = last_id;
            pacer.wait().await;
        }

        let deleted = sqlx::query(
            "UPDATE stripe_coupons SET is_deleted = TRUE, updated_at = NOW()
             WHERE NOT is_deleted AND NOT (id = ANY($1))",
        )
        .bind(&seen)
        .execute(&self.pool)
        .await?
        .rows_affected();
        counts.deleted = deleted as usize;

        tracing::info!(
            created = counts.created,
            updated = counts.updated,
            deleted = counts.deleted,
            "coupon reconciliation finished"
        );
        Ok(counts)
    }

    async fn insert_from_remote(
        &self,
        remote: &CouponObject,
        raw: &Value,
        created_by_us: bool,
    ) -> BillingResult<Coupon> {
        let result = sqlx::query_as::<_, Coupon>(
            "INSERT INTO stripe_coupons
                 (coupon_id, amount_off, percent_off, currency, duration,
                  duration_in_months, max_redemptions, times_redeemed, redeem_by,
                  livemode, valid, metadata, coupon_created, is_created_at_stripe,
                  stripe_response)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             RETURNING *",
        )
        .bind(&remote.id)
        .bind(remote.amount_off)
        .bind(remote.percent_off)
        .bind(&remote.currency)
        .bind(&remote.duration)
        .bind(remote.duration_in_months)
        .bind(remote.max_redemptions.map(|m| m as i32))
        .bind(remote.times_redeemed as i32)
        .bind(remote.redeem_by.map(timestamp_to_datetime))
        .bind(remote.livemode)
        .bind(remote.valid)
        .bind(&remote.metadata)
        .bind(timestamp_to_datetime(remote.created))
        .bind(created_by_us)
        .bind(raw)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(coupon) => Ok(coupon),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(BillingError::CouponAlreadyExists)
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Field-level update from remote state; writes only when something
    /// actually changed.
    async fn apply_remote_fields(
        &self,
        local: &Coupon,
        remote: &CouponObject,
        raw: &Value,
    ) -> BillingResult<bool> {
        let redeem_by = remote.redeem_by.map(timestamp_to_datetime);
        let max_redemptions = remote.max_redemptions.map(|m| m as i32);
        let times_redeemed = remote.times_redeemed as i32;

        let unchanged = local.valid == remote.valid
            && local.times_redeemed == times_redeemed
            && local.max_redemptions == max_redemptions
            && local.redeem_by == redeem_by
            && local.metadata == remote.metadata
            && local.livemode == remote.livemode;
        if unchanged {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE stripe_coupons
             SET valid = $2, times_redeemed = $3, max_redemptions = $4,
                 redeem_by = $5, metadata = $6, livemode = $7,
                 stripe_response = $8, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(local.id)
        .bind(remote.valid)
        .bind(times_redeemed)
        .bind(max_redemptions)
        .bind(redeem_by)
        .bind(&remote.metadata)
        .bind(remote.livemode)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> NewCoupon {
        NewCoupon {
            duration: DURATION_ONCE.to_string(),
            percent_off: Some(25.0),
            metadata: json!({}),
            ..NewCoupon::default()
        }
    }

    #[test]
    fn exactly_one_discount_field() {
        let mut both = base();
        both.amount_off = Some(500);
        both.currency = Some("usd".into());
        assert!(matches!(
            validate_new_coupon(&both),
            Err(BillingError::Validation(_))
        ));

        let mut neither = base();
        neither.percent_off = None;
        assert!(matches!(
            validate_new_coupon(&neither),
            Err(BillingError::Validation(_))
        ));

        assert!(validate_new_coupon(&base()).is_ok());
    }

    #[test]
    fn amount_off_requires_currency() {
        let mut new = base();
        new.percent_off = None;
        new.amount_off = Some(500);
        assert!(matches!(
            validate_new_coupon(&new),
            Err(BillingError::Validation(_))
        ));

        new.currency = Some("usd".into());
        assert!(validate_new_coupon(&new).is_ok());
    }

    #[test]
    fn duration_months_only_for_repeating() {
        let mut repeating = base();
        repeating.duration = DURATION_REPEATING.to_string();
        assert!(matches!(
            validate_new_coupon(&repeating),
            Err(BillingError::Validation(_))
        ));
        repeating.duration_in_months = Some(3);
        assert!(validate_new_coupon(&repeating).is_ok());

        let mut forever = base();
        forever.duration = DURATION_FOREVER.to_string();
        forever.duration_in_months = Some(3);
        assert!(matches!(
            validate_new_coupon(&forever),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn unknown_duration_rejected() {
        let mut new = base();
        new.duration = "biweekly".to_string();
        assert!(matches!(
            validate_new_coupon(&new),
            Err(BillingError::Validation(_))
        ));
    }
}
