//! Retry with exponential backoff for rate-limited registry operations.
//!
//! Only registry pressure is worth retrying: an error whose text contains
//! `HAP429` or `TOOMANYREQUESTS` backs off, everything else is permanent
//! and short-circuits. Waits race the cancellation token.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use regmirror_core::error::{Result, SyncError};

/// Initial backoff interval. Registries that return 429 stay saturated
/// for minutes, not milliseconds.
const INITIAL_INTERVAL: Duration = Duration::from_secs(60);

/// True when the error text marks transient registry pressure.
pub fn is_transient(err: &SyncError) -> bool {
    let text = err.to_string();
    text.contains("HAP429") || text.contains("TOOMANYREQUESTS")
}

/// Run `op` with exponential backoff, up to `max_attempts` tries.
///
/// `label` names the operation in logs. A cancelled token aborts a
/// pending wait and surfaces `SyncError::Cancelled`.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut interval = INITIAL_INTERVAL;
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }

                tracing::warn!(
                    operation = label,
                    error = %err,
                    backoff = ?interval,
                    attempt,
                    "Rate limited by registry, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
                interval *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}
