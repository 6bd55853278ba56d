//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use payledger_billing::{SignalHub, StripeClient, WebhookProcessor};
use payledger_shared::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub signals: SignalHub,
    pub webhooks: Arc<WebhookProcessor>,
}

impl AppState {
    pub fn new(config: &Config, pool: PgPool, client: StripeClient) -> Self {
        let signals = SignalHub::new();
        let webhooks = Arc::new(WebhookProcessor::new(
            client,
            pool.clone(),
            signals.clone(),
            config,
        ));
        Self {
            pool,
            signals,
            webhooks,
        }
    }
}
