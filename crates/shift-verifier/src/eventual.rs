//! Bounded polling with exponential backoff.
//!
//! Used where the cluster does expose a signal worth polling, such as backend
//! pods reporting Ready after the base deployment.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Timeout and backoff shape for one wait.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub timeout: Duration,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("Condition not met within {timeout:?} ({attempts} attempts)")]
    TimedOut { timeout: Duration, attempts: u32 },

    #[error("Wait cancelled")]
    Cancelled,
}

/// Poll `condition` until it returns true, the timeout elapses, or `cancel`
/// fires.
///
/// Delays start at `initial_delay`, double after every attempt, are capped at
/// `max_delay` and never overshoot the remaining time.
pub async fn wait_until<F, Fut>(
    backoff: Backoff,
    cancel: &CancellationToken,
    mut condition: F,
) -> Result<u32, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut delay = backoff.initial_delay;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }

        attempts += 1;
        if condition().await {
            return Ok(attempts);
        }

        let elapsed = start.elapsed();
        if elapsed >= backoff.timeout {
            return Err(WaitError::TimedOut {
                timeout: backoff.timeout,
                attempts,
            });
        }

        let remaining = backoff.timeout.saturating_sub(elapsed);
        let pause = delay.min(remaining);

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WaitError::Cancelled),
            () = sleep(pause) => {}
        }

        delay = (delay * 2).min(backoff.max_delay);
    }
}
