//! Billing signals
//!
//! Explicit event bus the engines publish to. Consumers (alerting,
//! analytics) subscribe at startup; emission is best-effort and never blocks
//! or fails the publishing operation.

use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum BillingSignal {
    ChargeSucceeded {
        charge_id: Uuid,
        stripe_charge_id: String,
        amount: i64,
    },
    /// Card decline or hard request error while charging; business-expected
    ChargeCardException {
        charge_id: Uuid,
        error: String,
    },
    ChargeRefunded {
        charge_id: Uuid,
        amount_refunded: i64,
        is_refunded: bool,
    },
    /// Emitted for every webhook event before dispatch, parsed or not
    WebhookPreParse {
        event_id: String,
        event_type: String,
        event_model: Option<String>,
        event_action: Option<String>,
    },
}

/// Broadcast hub for [`BillingSignal`]s.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<BillingSignal>,
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BillingSignal> {
        self.tx.subscribe()
    }

    /// Publish a signal. Dropped silently when nobody is subscribed.
    pub fn emit(&self, signal: BillingSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}
