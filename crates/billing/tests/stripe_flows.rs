//! Integration tests for the charge, refund, webhook, and card sync flows.
//!
//! Stripe is mocked with mockito; Postgres is real. Run with a disposable
//! database:
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/payledger_test"
//! cargo test -p payledger-billing -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use hmac::{Hmac, Mac};
use mockito::{Matcher, ServerGuard};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use payledger_billing::{
    BillingError, CardService, ChargeEngine, Customer, NewCharge, SignalHub, SourceRef,
    SourceRegistry, SourceResolver, StripeClient, WebhookProcessor,
};
use payledger_shared::Config;

const WEBHOOK_SECRET: &str = "whsec_test_secret";

struct Orders;

impl SourceResolver for Orders {
    fn label(&self, object_id: Uuid) -> String {
        format!("order {}", object_id)
    }
}

async fn setup(server: &ServerGuard) -> (Config, PgPool) {
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to test database");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let config = Config {
        database_url,
        stripe_secret_key: "sk_test_key".into(),
        stripe_webhook_secret: WEBHOOK_SECRET.into(),
        stripe_api_base: server.url(),
        webhook_tolerance_secs: 300,
        pending_events_threshold: 20,
        batch_pace_ms: 0,
        bind_address: "127.0.0.1:0".into(),
    };
    (config, pool)
}

fn engine(config: &Config, pool: &PgPool) -> ChargeEngine {
    let mut registry = SourceRegistry::new();
    registry.register("order", Arc::new(Orders));
    ChargeEngine::new(
        StripeClient::new(config).unwrap(),
        pool.clone(),
        SignalHub::new(),
        Arc::new(registry),
    )
}

async fn insert_customer(pool: &PgPool, user_id: Uuid, stripe_customer_id: &str) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO stripe_customers
             (user_id, stripe_customer_id, is_active, is_created_at_stripe)
         VALUES ($1, $2, TRUE, TRUE)
         RETURNING id",
    )
    .bind(user_id)
    .bind(stripe_customer_id)
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

async fn insert_captured_charge(
    pool: &PgPool,
    user_id: Uuid,
    amount: i64,
    stripe_charge_id: &str,
) -> Uuid {
    let (id,): (Uuid,) = sqlx::query_as(
        "INSERT INTO stripe_charges (user_id, amount, is_charged, stripe_charge_id)
         VALUES ($1, $2, TRUE, $3)
         RETURNING id",
    )
    .bind(user_id)
    .bind(amount)
    .bind(stripe_charge_id)
    .fetch_one(pool)
    .await
    .unwrap();
    id
}

fn sign(timestamp: i64, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, body).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// Scenario: a charge is pushed once, and a repeat attempt is refused locally.

#[tokio::test]
#[ignore = "requires postgres"]
async fn charge_captures_once_and_refuses_repeats() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let user_id = Uuid::new_v4();
    insert_customer(&pool, user_id, "cus_charge_once").await;
    let charge = engine
        .enqueue(NewCharge {
            user_id,
            amount: 1000,
            description: "order payment".into(),
            comment: String::new(),
            statement_descriptor: String::new(),
            is_manual: false,
            source: Some(SourceRef {
                kind: "order".into(),
                object_id: Uuid::new_v4(),
            }),
        })
        .await
        .unwrap();

    let mock = server
        .mock("POST", "/v1/charges")
        .match_header("idempotency-key", Matcher::Regex("-order-seed-1$".into()))
        .with_status(200)
        .with_body(
            json!({"id": "ch_once", "amount": 1000, "amount_refunded": 0, "status": "succeeded"})
                .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let remote = engine.charge(charge.id, "seed-1").await.unwrap().unwrap();
    assert_eq!(remote.id, "ch_once");

    let row = payledger_billing::Charge::get(&pool, charge.id).await.unwrap();
    assert!(row.is_charged);
    assert_eq!(row.stripe_charge_id, "ch_once");

    // the fast-fail guard fires before any remote call
    assert!(matches!(
        engine.charge(charge.id, "seed-1").await,
        Err(BillingError::AlreadyCharged)
    ));
    mock.assert_async().await;
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn charge_without_active_customer_is_skipped() {
    let server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let charge = engine
        .enqueue(NewCharge {
            user_id: Uuid::new_v4(),
            amount: 500,
            description: "orphan".into(),
            comment: String::new(),
            statement_descriptor: String::new(),
            is_manual: false,
            source: None,
        })
        .await
        .unwrap();

    // no customer row exists for this user; nothing should reach stripe
    assert!(engine.charge(charge.id, "seed").await.unwrap().is_none());
    let row = payledger_billing::Charge::get(&pool, charge.id).await.unwrap();
    assert!(!row.is_charged);
    assert!(!row.charge_attempt_failed);
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn declined_charge_records_failure_and_returns_clean() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let user_id = Uuid::new_v4();
    insert_customer(&pool, user_id, "cus_decline").await;
    let charge = engine
        .enqueue(NewCharge {
            user_id,
            amount: 700,
            description: "declined order".into(),
            comment: String::new(),
            statement_descriptor: String::new(),
            is_manual: false,
            source: None,
        })
        .await
        .unwrap();

    server
        .mock("POST", "/v1/charges")
        .with_status(402)
        .with_body(
            json!({"error": {
                "type": "card_error",
                "code": "card_declined",
                "message": "Your card was declined.",
                "charge": "ch_declined_1"
            }})
            .to_string(),
        )
        .create_async()
        .await;

    // a decline is a recorded outcome, not an error
    assert!(engine.charge(charge.id, "seed").await.unwrap().is_none());

    let row = payledger_billing::Charge::get(&pool, charge.id).await.unwrap();
    assert!(!row.is_charged);
    assert!(row.charge_attempt_failed);
    assert_eq!(row.stripe_charge_id, "ch_declined_1");
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn transient_fault_is_retryable_and_marks_attempt() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let user_id = Uuid::new_v4();
    insert_customer(&pool, user_id, "cus_transient").await;
    let charge = engine
        .enqueue(NewCharge {
            user_id,
            amount: 700,
            description: "flaky".into(),
            comment: String::new(),
            statement_descriptor: String::new(),
            is_manual: false,
            source: None,
        })
        .await
        .unwrap();

    server
        .mock("POST", "/v1/charges")
        .with_status(503)
        .with_body(json!({"error": {"type": "api_error", "message": "overloaded"}}).to_string())
        .create_async()
        .await;

    let error = engine.charge(charge.id, "seed").await.unwrap_err();
    assert!(error.is_retryable());
}

// Scenario: two partial refunds that together return the full amount.

#[tokio::test]
#[ignore = "requires postgres"]
async fn partial_refunds_accumulate_to_fully_refunded() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let charge_id = insert_captured_charge(&pool, Uuid::new_v4(), 100, "ch_partial").await;

    server
        .mock("POST", "/v1/refunds")
        .with_status(200)
        .with_body(json!({"id": "re_1", "amount": 30}).to_string())
        .expect_at_least(2)
        .create_async()
        .await;

    let after_first = engine.refund(charge_id, Some(30)).await.unwrap();
    assert_eq!(after_first.amount_refunded, 30);
    assert!(!after_first.is_refunded);

    // None refunds the remainder
    let after_second = engine.refund(charge_id, None).await.unwrap();
    assert_eq!(after_second.amount_refunded, 100);
    assert!(after_second.is_refunded);

    assert!(matches!(
        engine.refund(charge_id, Some(1)).await,
        Err(BillingError::AlreadyRefunded)
    ));
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn refund_over_remainder_is_rejected_locally() {
    let server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let charge_id = insert_captured_charge(&pool, Uuid::new_v4(), 100, "ch_over").await;
    sqlx::query("UPDATE stripe_charges SET amount_refunded = 30 WHERE id = $1")
        .bind(charge_id)
        .execute(&pool)
        .await
        .unwrap();

    match engine.refund(charge_id, Some(80)).await.unwrap_err() {
        BillingError::RefundsExceedCharge {
            requested,
            refunded,
            amount,
        } => assert_eq!((requested, refunded, amount), (80, 30, 100)),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn already_refunded_remotely_still_updates_ledger() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let charge_id = insert_captured_charge(&pool, Uuid::new_v4(), 100, "ch_done_remote").await;

    server
        .mock("POST", "/v1/refunds")
        .with_status(400)
        .with_body(
            json!({"error": {
                "type": "invalid_request_error",
                "code": "charge_already_refunded",
                "message": "Charge ch_done_remote has already been refunded."
            }})
            .to_string(),
        )
        .create_async()
        .await;

    let updated = engine.refund(charge_id, None).await.unwrap();
    assert_eq!(updated.amount_refunded, 100);
    assert!(updated.is_refunded);
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn refund_drift_adopts_remote_then_surfaces() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let engine = engine(&config, &pool);

    let charge_id = insert_captured_charge(&pool, Uuid::new_v4(), 100, "ch_drift").await;

    // every refund attempt is rejected with a non-specific invalid request
    server
        .mock("POST", "/v1/refunds")
        .with_status(400)
        .with_body(
            json!({"error": {
                "type": "invalid_request_error",
                "message": "Refund amount would exceed the refundable amount."
            }})
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    // remote already shows 50 refunded; local shows 0
    server
        .mock("GET", "/v1/charges/ch_drift")
        .with_status(200)
        .with_body(
            json!({"id": "ch_drift", "amount": 100, "amount_refunded": 50, "status": "succeeded"})
                .to_string(),
        )
        .create_async()
        .await;

    match engine.refund(charge_id, None).await.unwrap_err() {
        BillingError::ReconciliationDrift(_) => {}
        other => panic!("unexpected error: {}", other),
    }

    // the remote total was adopted before the bounded retry gave up
    let row = payledger_billing::Charge::get(&pool, charge_id).await.unwrap();
    assert_eq!(row.amount_refunded, 50);
}

// Scenario: the same webhook delivered twice is stored exactly once.

#[tokio::test]
#[ignore = "requires postgres"]
async fn webhook_replay_is_rejected_after_first_ingest() {
    let server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let client = StripeClient::new(&config).unwrap();
    let processor = WebhookProcessor::new(client, pool.clone(), SignalHub::new(), &config);

    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let body = json!({"id": event_id, "type": "ping.pong", "data": {"object": {}}}).to_string();
    let header = sign(now(), &body);

    let event = processor.receive(&body, &header).await.unwrap();
    assert_eq!(event.id, event_id);
    assert!(event.is_parsed);
    assert_eq!(event.parse_error, "");

    match processor.receive(&body, &header).await.unwrap_err() {
        payledger_billing::webhook::ReceiveError::Rejected(rejection) => {
            assert_eq!(
                rejection,
                payledger_billing::WebhookRejection::AlreadyReceived
            );
            assert_eq!(rejection.to_string(), "already received");
        }
        other => panic!("unexpected error: {}", other),
    }

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM stripe_webhook_events WHERE id = $1")
            .bind(&event_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn redelivery_finishes_an_interrupted_dispatch() {
    let server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let client = StripeClient::new(&config).unwrap();
    let processor = WebhookProcessor::new(client, pool.clone(), SignalHub::new(), &config);

    // a prior delivery stored the payload but died before dispatch finished
    let event_id = format!("evt_{}", Uuid::new_v4().simple());
    let body = json!({"id": event_id, "type": "ping.pong", "data": {"object": {}}}).to_string();
    sqlx::query("INSERT INTO stripe_webhook_events (id, raw_data) VALUES ($1, $2::jsonb)")
        .bind(&event_id)
        .bind(&body)
        .execute(&pool)
        .await
        .unwrap();

    // stripe's redelivery completes the dispatch instead of being refused
    let event = processor.receive(&body, &sign(now(), &body)).await.unwrap();
    assert!(event.is_parsed);
    assert_eq!(event.parse_error, "");

    // a further replay of the now-finished event is refused
    match processor.receive(&body, &sign(now(), &body)).await.unwrap_err() {
        payledger_billing::webhook::ReceiveError::Rejected(rejection) => {
            assert_eq!(
                rejection,
                payledger_billing::WebhookRejection::AlreadyReceived
            );
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn card_sweep_targets_one_active_customer_per_user() {
    let server = mockito::Server::new_async().await;
    let (_config, pool) = setup(&server).await;

    let swept_user = Uuid::new_v4();
    let lapsed_user = Uuid::new_v4();
    let unpromoted_user = Uuid::new_v4();

    // two active promoted rows for the same user; only the newest counts
    sqlx::query(
        "INSERT INTO stripe_customers
             (user_id, stripe_customer_id, is_active, is_created_at_stripe, created_at)
         VALUES ($1, 'cus_sweep_old', TRUE, TRUE, NOW() - INTERVAL '1 day')",
    )
    .bind(swept_user)
    .execute(&pool)
    .await
    .unwrap();
    insert_customer(&pool, swept_user, "cus_sweep_new").await;
    sqlx::query(
        "INSERT INTO stripe_customers (user_id, stripe_customer_id, is_active, is_created_at_stripe)
         VALUES ($1, 'cus_sweep_inactive', FALSE, TRUE),
                ($2, 'cus_sweep_unpromoted', TRUE, FALSE)",
    )
    .bind(lapsed_user)
    .bind(unpromoted_user)
    .execute(&pool)
    .await
    .unwrap();

    let customers = Customer::active_promoted_per_user(&pool).await.unwrap();
    let swept: Vec<_> = customers
        .iter()
        .filter(|c| c.user_id == swept_user)
        .collect();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].stripe_customer_id, "cus_sweep_new");
    assert!(!customers.iter().any(|c| c.user_id == lapsed_user));
    assert!(!customers.iter().any(|c| c.user_id == unpromoted_user));
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn coupon_created_webhook_mirrors_the_coupon() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let client = StripeClient::new(&config).unwrap();
    let processor = WebhookProcessor::new(client, pool.clone(), SignalHub::new(), &config);

    let coupon_id = format!("SPRING{}", Uuid::new_v4().simple());
    let created = now();
    let remote_coupon = json!({
        "id": coupon_id,
        "percent_off": 25.0,
        "duration": "once",
        "times_redeemed": 0,
        "valid": true,
        "livemode": false,
        "metadata": {},
        "created": created
    });

    server
        .mock("GET", format!("/v1/coupons/{}", coupon_id).as_str())
        .with_status(200)
        .with_body(remote_coupon.to_string())
        .create_async()
        .await;

    let body = json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "coupon.created",
        "data": {"object": remote_coupon}
    })
    .to_string();

    let event = processor.receive(&body, &sign(now(), &body)).await.unwrap();
    assert!(event.is_parsed);
    assert_eq!(event.parse_error, "");

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM stripe_coupons WHERE coupon_id = $1 AND NOT is_deleted",
    )
    .bind(&coupon_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    // the same coupon announced again parses with an error recorded, not a 500
    let replay_body = json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "coupon.created",
        "data": {"object": remote_coupon}
    })
    .to_string();
    let event = processor
        .receive(&replay_body, &sign(now(), &replay_body))
        .await
        .unwrap();
    assert!(event.is_parsed);
    assert!(event.parse_error.contains("already exists"));
}

#[tokio::test]
#[ignore = "requires postgres"]
async fn coupon_deleted_webhook_soft_deletes_locally() {
    let server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let client = StripeClient::new(&config).unwrap();
    let processor = WebhookProcessor::new(client, pool.clone(), SignalHub::new(), &config);

    let coupon_id = format!("GONE{}", Uuid::new_v4().simple());
    let created = now();
    sqlx::query(
        "INSERT INTO stripe_coupons (coupon_id, percent_off, duration, coupon_created)
         VALUES ($1, 10, 'once', to_timestamp($2))",
    )
    .bind(&coupon_id)
    .bind(created)
    .execute(&pool)
    .await
    .unwrap();

    let body = json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "coupon.deleted",
        "data": {"object": {"id": coupon_id, "created": created}}
    })
    .to_string();
    // no remote call happens for deletions; the mock server stays silent
    let event = processor.receive(&body, &sign(now(), &body)).await.unwrap();
    assert!(event.is_parsed);
    assert_eq!(event.parse_error, "");

    let (is_deleted,): (bool,) =
        sqlx::query_as("SELECT is_deleted FROM stripe_coupons WHERE coupon_id = $1")
            .bind(&coupon_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(is_deleted);
}

// Scenario: card sync converges and a second run writes nothing.

#[tokio::test]
#[ignore = "requires postgres"]
async fn card_sync_converges_and_second_run_is_a_noop() {
    let mut server = mockito::Server::new_async().await;
    let (config, pool) = setup(&server).await;
    let client = StripeClient::new(&config).unwrap();
    let cards = CardService::new(client, pool.clone());

    let user_id = Uuid::new_v4();
    let remote_id = format!("cus_{}", Uuid::new_v4().simple());
    let customer_id = insert_customer(&pool, user_id, &remote_id).await;

    // a stale local card that no longer exists remotely
    sqlx::query(
        "INSERT INTO stripe_cards (customer_id, stripe_card_id, last4, exp_month, exp_year)
         VALUES ($1, 'card_stale', '0000', 1, 2020)",
    )
    .bind(customer_id)
    .execute(&pool)
    .await
    .unwrap();

    server
        .mock("GET", format!("/v1/customers/{}", remote_id).as_str())
        .with_status(200)
        .with_body(
            json!({
                "id": remote_id,
                "default_source": "card_live",
                "sources": {"data": [{"id": "card_live"}], "has_more": false}
            })
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;
    server
        .mock(
            "GET",
            Matcher::Regex(format!("/v1/customers/{}/sources.*", remote_id)),
        )
        .with_status(200)
        .with_body(
            json!({
                "data": [{"id": "card_live", "last4": "4242", "exp_month": 12, "exp_year": 2030}],
                "has_more": false
            })
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let counts = cards
        .sync_customer(&Customer::get(&pool, customer_id).await.unwrap())
        .await
        .unwrap();
    assert_eq!(counts.created, 1);
    assert_eq!(counts.deleted, 1);
    assert_eq!(counts.updated, 0);

    let customer = Customer::get(&pool, customer_id).await.unwrap();
    let (default_card,): (String,) =
        sqlx::query_as("SELECT stripe_card_id FROM stripe_cards WHERE id = $1")
            .bind(customer.default_card_id.unwrap())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(default_card, "card_live");

    // convergence: the second run decides nothing needs doing
    let counts = cards.sync_customer(&customer).await.unwrap();
    assert_eq!(counts, payledger_billing::CardSyncCounts::default());
}
