use std::fmt::Display;
use std::future::Future;
use rand::Rng;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Decides how long to wait after `failures` consecutive failures, or
/// whether to stop trying.
pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, failures: u32) -> Option<Duration>;
}

/// Never gives up. Exponential backoff, capped, with jitter.
#[derive(Debug, Clone)]
pub struct Forever {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// Extra random fraction of the delay added on top (0.0 disables).
    pub jitter: f64,
}

impl Forever {
    pub fn new(base: Duration, max: Duration) -> Self {
        Forever {
            base,
            multiplier: 2.0,
            max,
            jitter: 0.25,
        }
    }

    fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(30) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

impl RetryPolicy for Forever {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        let backoff = self.backoff(failures);
        let jitter = if self.jitter > 0.0 {
            backoff.mul_f64(rand::thread_rng().gen_range(0.0..self.jitter))
        } else {
            Duration::ZERO
        };
        Some((backoff + jitter).min(self.max))
    }
}

/// Fixed delay, bounded number of retries.
#[derive(Debug, Clone)]
pub struct Limited {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy for Limited {
    fn next_delay(&self, failures: u32) -> Option<Duration> {
        (failures <= self.retries).then_some(self.delay)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted(E),
}

/// Sleep unless cancelled first. Returns false on cancellation.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Run `op` until it succeeds, the policy gives up, or `cancel` fires.
/// Errors for which `transient` is false are returned immediately as
/// `Exhausted`.
pub async fn retry_when<T, E, F, Fut, P>(
    policy: &dyn RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    transient: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut failures = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !transient(&e) => return Err(RetryError::Exhausted(e)),
            Err(e) => {
                failures += 1;
                let Some(delay) = policy.next_delay(failures) else {
                    return Err(RetryError::Exhausted(e));
                };
                warn!(what, failures, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                if !sleep_or_cancel(cancel, delay).await {
                    return Err(RetryError::Cancelled);
                }
            }
        }
    }
}
