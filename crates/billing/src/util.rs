//! Small conversions and retry plumbing shared across engines

use std::future::Future;

use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::client::{ProcessorError, ProcessorErrorKind};

const RETRY_ATTEMPTS: usize = 5;
const RETRY_INTERVAL_MS: u64 = 500;

/// Run a Stripe call, retrying only transient faults up to five times at a
/// fixed interval. Hard errors surface immediately.
pub async fn retry_transient<T, F, Fut>(action: F) -> Result<T, ProcessorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProcessorError>>,
{
    let strategy = FixedInterval::from_millis(RETRY_INTERVAL_MS).take(RETRY_ATTEMPTS);
    RetryIf::spawn(strategy, action, |error: &ProcessorError| {
        error.kind == ProcessorErrorKind::Transient
    })
    .await
}

/// Convert a Stripe unix timestamp into an `OffsetDateTime`.
///
/// Stripe timestamps are service-assigned and always valid in practice; an
/// out-of-range value falls back to the epoch rather than failing the caller.
pub fn timestamp_to_datetime(timestamp: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(timestamp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_known_timestamp() {
        let dt = timestamp_to_datetime(1_496_861_935);
        assert_eq!(dt.unix_timestamp(), 1_496_861_935);
    }

    #[test]
    fn out_of_range_falls_back_to_epoch() {
        assert_eq!(timestamp_to_datetime(i64::MAX), OffsetDateTime::UNIX_EPOCH);
    }
}
