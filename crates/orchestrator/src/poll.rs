//! Cancellable polling with bounded backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use certpilot_common::BackoffPolicy;

/// Why a polling loop stopped without success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    Exhausted { attempts: u32, elapsed: Duration },
    Cancelled,
}

/// Run `check` until it returns `true`, the policy is exhausted, or `cancel` fires.
///
/// Returns the number of attempts it took.
pub async fn poll_until<F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<u32, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut backoff = policy.start();

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        let attempt = backoff.record_attempt();
        if check(attempt).await {
            return Ok(attempt);
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(PollError::Exhausted {
                attempts: backoff.attempts(),
                elapsed: backoff.elapsed(),
            });
        };

        trace!(attempt, delay_ms = delay.as_millis() as u64, "Poll attempt failed, backing off");

        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Sleep for `delay` unless cancelled first; returns `false` on cancellation
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
