//! Stripe REST client
//!
//! Typed façade over the Stripe HTTP API. Built directly on reqwest so that
//! idempotency keys, the request timeout, and error classification stay fully
//! under our control; the raw JSON body of every response is retained for the
//! ledger's `stripe_response` columns.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use payledger_shared::Config;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_PAGE_LIMIT: u32 = 100;

/// How a Stripe error should be handled by the calling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorErrorKind {
    /// Card-level decline; an expected business outcome, not a fault
    CardDeclined,
    /// Stripe rejected the request as malformed (includes 404s)
    InvalidRequest,
    /// 5xx or transport failure; safe to retry later
    Transient,
    /// Anything Stripe returned that fits no known shape
    Other,
}

/// Structured Stripe API error.
#[derive(Debug, Clone)]
pub struct ProcessorError {
    pub kind: ProcessorErrorKind,
    pub code: Option<String>,
    pub message: String,
    /// Charge id Stripe attached to the error, when present
    pub charge_id: Option<String>,
    pub http_status: Option<u16>,
    /// Raw error body as returned by Stripe
    pub body: Value,
}

impl ProcessorError {
    fn transport(message: String) -> Self {
        Self {
            kind: ProcessorErrorKind::Transient,
            code: None,
            message,
            charge_id: None,
            http_status: None,
            body: Value::Null,
        }
    }

    /// Classify an error response body returned with `http_status`.
    pub fn from_response(http_status: u16, body: Value) -> Self {
        let error = &body["error"];
        let error_type = error["type"].as_str().unwrap_or_default();

        let kind = if error_type == "card_error" {
            ProcessorErrorKind::CardDeclined
        } else if http_status >= 500 {
            ProcessorErrorKind::Transient
        } else if error_type == "invalid_request_error" {
            ProcessorErrorKind::InvalidRequest
        } else {
            ProcessorErrorKind::Other
        };

        Self {
            kind,
            code: error["code"].as_str().map(str::to_string),
            message: error["message"]
                .as_str()
                .unwrap_or("unrecognized stripe error")
                .to_string(),
            charge_id: error["charge"].as_str().map(str::to_string),
            http_status: Some(http_status),
            body,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }

    pub fn code_is(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(code) = &self.code {
            write!(f, " [{}]", code)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ProcessorError {}

pub type ClientResult<T> = Result<T, ProcessorError>;

// Wire objects. Each carries only the fields the engines read; the raw body
// travels alongside for persistence.

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundObject {
    pub id: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardObject {
    pub id: String,
    #[serde(default)]
    pub last4: String,
    #[serde(default)]
    pub exp_month: i32,
    #[serde(default)]
    pub exp_year: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CouponObject {
    pub id: String,
    #[serde(default)]
    pub amount_off: Option<i64>,
    #[serde(default)]
    pub percent_off: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub duration: String,
    #[serde(default)]
    pub duration_in_months: Option<i32>,
    #[serde(default)]
    pub max_redemptions: Option<i64>,
    #[serde(default)]
    pub redeem_by: Option<i64>,
    #[serde(default)]
    pub times_redeemed: i64,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub livemode: bool,
    #[serde(default)]
    pub metadata: Value,
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerObject {
    pub id: String,
    #[serde(default)]
    pub default_source: Option<String>,
    /// Legacy sources list embedded in the customer object
    #[serde(default)]
    pub sources: Option<ListObject<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanObject {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventObject {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListObject<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

/// Parameters for a charge creation call.
#[derive(Debug, Clone)]
pub struct ChargeParams<'a> {
    pub amount: i64,
    pub currency: &'a str,
    pub customer: &'a str,
    pub description: &'a str,
    pub statement_descriptor: Option<&'a str>,
    /// Forensic metadata (polymorphic association ids)
    pub metadata: Vec<(String, String)>,
}

/// Parameters for a coupon creation call.
#[derive(Debug, Clone, Default)]
pub struct CouponParams<'a> {
    /// None lets Stripe generate an id
    pub coupon_id: Option<&'a str>,
    pub duration: &'a str,
    pub amount_off: Option<i64>,
    pub currency: Option<&'a str>,
    pub duration_in_months: Option<i32>,
    pub max_redemptions: Option<i64>,
    pub percent_off: Option<f64>,
    pub redeem_by: Option<i64>,
    pub metadata: Value,
}

/// Parameters for a plan creation call.
#[derive(Debug, Clone)]
pub struct PlanParams<'a> {
    pub plan_id: &'a str,
    pub amount: i64,
    pub currency: &'a str,
    pub interval: &'a str,
    pub interval_count: i32,
    pub name: &'a str,
    pub statement_descriptor: Option<&'a str>,
    pub trial_period_days: i32,
    pub metadata: Value,
}

/// Parameters for a subscription creation call.
#[derive(Debug, Clone)]
pub struct SubscriptionParams<'a> {
    pub customer: &'a str,
    pub plan: &'a str,
    pub tax_percent: f64,
    pub coupon: Option<&'a str>,
    pub metadata: Value,
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_base: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(config: &Config) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProcessorError::transport(e.to_string()))?;

        Ok(Self {
            http,
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            secret_key: config.stripe_secret_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ClientResult<Value> {
        let response = request
            .basic_auth(&self.secret_key, None::<&str>)
            .send()
            .await
            .map_err(|e| ProcessorError::transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProcessorError::transport(format!("invalid response body: {}", e)))?;

        if (200..300).contains(&status) {
            Ok(body)
        } else {
            Err(ProcessorError::from_response(status, body))
        }
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> ClientResult<Value> {
        self.send(self.http.get(self.url(path)).query(query)).await
    }

    async fn post(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> ClientResult<Value> {
        let mut request = self.http.post(self.url(path)).form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        self.send(request).await
    }

    async fn delete(&self, path: &str, form: &[(String, String)]) -> ClientResult<Value> {
        self.send(self.http.delete(self.url(path)).form(form)).await
    }

    // Charges

    pub async fn create_charge(
        &self,
        params: &ChargeParams<'_>,
        idempotency_key: &str,
    ) -> ClientResult<(ChargeObject, Value)> {
        let mut form = vec![
            ("amount".to_string(), params.amount.to_string()),
            ("currency".to_string(), params.currency.to_string()),
            ("customer".to_string(), params.customer.to_string()),
            ("description".to_string(), params.description.to_string()),
        ];
        if let Some(descriptor) = params.statement_descriptor {
            form.push(("statement_descriptor".to_string(), descriptor.to_string()));
        }
        for (key, value) in &params.metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
        }

        let raw = self.post("/v1/charges", &form, Some(idempotency_key)).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn retrieve_charge(&self, charge_id: &str) -> ClientResult<(ChargeObject, Value)> {
        let raw = self.get(&format!("/v1/charges/{}", charge_id), &[]).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn create_refund(
        &self,
        charge_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> ClientResult<(RefundObject, Value)> {
        let form = vec![
            ("charge".to_string(), charge_id.to_string()),
            ("amount".to_string(), amount.to_string()),
        ];
        let raw = self.post("/v1/refunds", &form, Some(idempotency_key)).await?;
        Ok((parse_object(&raw)?, raw))
    }

    // Coupons

    pub async fn create_coupon(&self, params: &CouponParams<'_>) -> ClientResult<(CouponObject, Value)> {
        let mut form = vec![("duration".to_string(), params.duration.to_string())];
        if let Some(id) = params.coupon_id {
            form.push(("id".to_string(), id.to_string()));
        }
        if let Some(amount_off) = params.amount_off {
            form.push(("amount_off".to_string(), amount_off.to_string()));
        }
        if let Some(currency) = params.currency {
            form.push(("currency".to_string(), currency.to_string()));
        }
        if let Some(months) = params.duration_in_months {
            form.push(("duration_in_months".to_string(), months.to_string()));
        }
        if let Some(max) = params.max_redemptions {
            form.push(("max_redemptions".to_string(), max.to_string()));
        }
        if let Some(percent_off) = params.percent_off {
            form.push(("percent_off".to_string(), percent_off.to_string()));
        }
        if let Some(redeem_by) = params.redeem_by {
            form.push(("redeem_by".to_string(), redeem_by.to_string()));
        }
        push_metadata(&mut form, &params.metadata);

        let raw = self.post("/v1/coupons", &form, None).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn retrieve_coupon(&self, coupon_id: &str) -> ClientResult<(CouponObject, Value)> {
        let raw = self.get(&format!("/v1/coupons/{}", coupon_id), &[]).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn update_coupon_metadata(
        &self,
        coupon_id: &str,
        metadata: &Value,
    ) -> ClientResult<(CouponObject, Value)> {
        let mut form = Vec::new();
        push_metadata(&mut form, metadata);
        let raw = self
            .post(&format!("/v1/coupons/{}", coupon_id), &form, None)
            .await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn delete_coupon(&self, coupon_id: &str) -> ClientResult<Value> {
        self.delete(&format!("/v1/coupons/{}", coupon_id), &[]).await
    }

    pub async fn list_coupons(&self, starting_after: Option<&str>) -> ClientResult<ListObject<Value>> {
        let mut query = vec![("limit", LIST_PAGE_LIMIT.to_string())];
        if let Some(cursor) = starting_after {
            query.push(("starting_after", cursor.to_string()));
        }
        let raw = self.get("/v1/coupons", &query).await?;
        parse_object(&raw)
    }

    // Customers

    pub async fn create_customer(
        &self,
        source_token: &str,
        description: &str,
    ) -> ClientResult<(CustomerObject, Value)> {
        let form = vec![
            ("source".to_string(), source_token.to_string()),
            ("description".to_string(), description.to_string()),
        ];
        let raw = self.post("/v1/customers", &form, None).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn retrieve_customer(&self, customer_id: &str) -> ClientResult<(CustomerObject, Value)> {
        let raw = self
            .get(&format!("/v1/customers/{}", customer_id), &[])
            .await?;
        Ok((parse_object(&raw)?, raw))
    }

    /// Attach a new source to the customer and make it the default.
    pub async fn update_customer_source(
        &self,
        customer_id: &str,
        source_token: &str,
    ) -> ClientResult<(CustomerObject, Value)> {
        let form = vec![("source".to_string(), source_token.to_string())];
        let raw = self
            .post(&format!("/v1/customers/{}", customer_id), &form, None)
            .await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn list_customer_cards(
        &self,
        customer_id: &str,
        starting_after: Option<&str>,
    ) -> ClientResult<ListObject<Value>> {
        let mut query = vec![
            ("object", "card".to_string()),
            ("limit", LIST_PAGE_LIMIT.to_string()),
        ];
        if let Some(cursor) = starting_after {
            query.push(("starting_after", cursor.to_string()));
        }
        let raw = self
            .get(&format!("/v1/customers/{}/sources", customer_id), &query)
            .await?;
        parse_object(&raw)
    }

    pub async fn list_customers(&self, starting_after: Option<&str>) -> ClientResult<ListObject<Value>> {
        let mut query = vec![("limit", LIST_PAGE_LIMIT.to_string())];
        if let Some(cursor) = starting_after {
            query.push(("starting_after", cursor.to_string()));
        }
        let raw = self.get("/v1/customers", &query).await?;
        parse_object(&raw)
    }

    // Plans and subscriptions

    pub async fn create_plan(&self, params: &PlanParams<'_>) -> ClientResult<(PlanObject, Value)> {
        let mut form = vec![
            ("id".to_string(), params.plan_id.to_string()),
            ("amount".to_string(), params.amount.to_string()),
            ("currency".to_string(), params.currency.to_string()),
            ("interval".to_string(), params.interval.to_string()),
            ("interval_count".to_string(), params.interval_count.to_string()),
            ("nickname".to_string(), params.name.to_string()),
            ("trial_period_days".to_string(), params.trial_period_days.to_string()),
        ];
        if let Some(descriptor) = params.statement_descriptor {
            form.push(("statement_descriptor".to_string(), descriptor.to_string()));
        }
        push_metadata(&mut form, &params.metadata);

        let raw = self.post("/v1/plans", &form, None).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn create_subscription(
        &self,
        params: &SubscriptionParams<'_>,
    ) -> ClientResult<(SubscriptionObject, Value)> {
        let mut form = vec![
            ("customer".to_string(), params.customer.to_string()),
            ("plan".to_string(), params.plan.to_string()),
            ("tax_percent".to_string(), params.tax_percent.to_string()),
        ];
        if let Some(coupon) = params.coupon {
            form.push(("coupon".to_string(), coupon.to_string()));
        }
        push_metadata(&mut form, &params.metadata);

        let raw = self.post("/v1/subscriptions", &form, None).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> ClientResult<(SubscriptionObject, Value)> {
        let raw = self
            .get(&format!("/v1/subscriptions/{}", subscription_id), &[])
            .await?;
        Ok((parse_object(&raw)?, raw))
    }

    /// Cancel a subscription, either immediately or at the period end.
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> ClientResult<(SubscriptionObject, Value)> {
        let raw = if at_period_end {
            let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
            self.post(&format!("/v1/subscriptions/{}", subscription_id), &form, None)
                .await?
        } else {
            self.delete(&format!("/v1/subscriptions/{}", subscription_id), &[])
                .await?
        };
        Ok((parse_object(&raw)?, raw))
    }

    // Events

    pub async fn retrieve_event(&self, event_id: &str) -> ClientResult<(EventObject, Value)> {
        let raw = self.get(&format!("/v1/events/{}", event_id), &[]).await?;
        Ok((parse_object(&raw)?, raw))
    }

    pub async fn list_events(&self, ending_before: Option<&str>) -> ClientResult<ListObject<Value>> {
        let mut query = vec![("limit", LIST_PAGE_LIMIT.to_string())];
        if let Some(cursor) = ending_before {
            query.push(("ending_before", cursor.to_string()));
        }
        let raw = self.get("/v1/events", &query).await?;
        parse_object(&raw)
    }
}

/// Parse a typed view out of a raw Stripe response.
pub fn parse_object<T: serde::de::DeserializeOwned>(raw: &Value) -> ClientResult<T> {
    serde_json::from_value(raw.clone()).map_err(|e| ProcessorError {
        kind: ProcessorErrorKind::Other,
        code: None,
        message: format!("unexpected stripe response shape: {}", e),
        charge_id: None,
        http_status: None,
        body: raw.clone(),
    })
}

fn push_metadata(form: &mut Vec<(String, String)>, metadata: &Value) {
    if let Some(object) = metadata.as_object() {
        for (key, value) in object {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form.push((format!("metadata[{}]", key), rendered));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn card_error_classified_as_decline() {
        let body = json!({
            "error": {
                "type": "card_error",
                "code": "card_declined",
                "message": "Your card was declined.",
                "charge": "ch_declined"
            }
        });
        let err = ProcessorError::from_response(402, body);
        assert_eq!(err.kind, ProcessorErrorKind::CardDeclined);
        assert_eq!(err.charge_id.as_deref(), Some("ch_declined"));
        assert!(err.code_is("card_declined"));
    }

    #[test]
    fn five_hundreds_are_transient() {
        let err = ProcessorError::from_response(503, json!({"error": {"type": "api_error"}}));
        assert_eq!(err.kind, ProcessorErrorKind::Transient);
    }

    #[test]
    fn invalid_request_and_not_found() {
        let body = json!({
            "error": {"type": "invalid_request_error", "message": "No such coupon: nope"}
        });
        let err = ProcessorError::from_response(404, body);
        assert_eq!(err.kind, ProcessorErrorKind::InvalidRequest);
        assert!(err.is_not_found());
    }

    #[test]
    fn unknown_shape_is_other() {
        let err = ProcessorError::from_response(400, json!({"weird": true}));
        assert_eq!(err.kind, ProcessorErrorKind::Other);
        assert_eq!(err.message, "unrecognized stripe error");
    }

    #[test]
    fn metadata_pairs_render_strings_unquoted() {
        let mut form = Vec::new();
        push_metadata(&mut form, &json!({"object_id": "42", "kind": 7}));
        form.sort();
        assert_eq!(
            form,
            vec![
                ("metadata[kind]".to_string(), "7".to_string()),
                ("metadata[object_id]".to_string(), "42".to_string()),
            ]
        );
    }

    #[test]
    fn list_object_defaults() {
        let list: ListObject<Value> = serde_json::from_value(json!({"data": []})).unwrap();
        assert!(!list.has_more);
        assert!(list.data.is_empty());
    }
}
