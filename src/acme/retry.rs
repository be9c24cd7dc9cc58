//! Polling primitive for the CA's asynchronous state machines.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::error::{AcmeError, Result};

/// Delay between polls when the CA gives no retry hint.
const POLL_INTERVAL: Duration = Duration::from_millis(3000);

/// Drive a producer until it yields a value.
///
/// `Ok(Some(value))` completes the call; `Ok(None)` retries after the poll
/// interval; [`AcmeError::RetryAfter`] retries once the server-supplied
/// deadline has passed; any other error completes with that error.
pub(crate) async fn fetch_with_retry<T, F, Fut>(mut producer: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    loop {
        let delay = match producer().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => POLL_INTERVAL,
            Err(AcmeError::RetryAfter { until }) => {
                (until - Utc::now()).to_std().unwrap_or(Duration::ZERO)
            }
            Err(e) => return Err(e),
        };
        info!(delay_ms = delay.as_millis() as u64, "Recheck scheduled");
        tokio::time::sleep(delay).await;
    }
}
