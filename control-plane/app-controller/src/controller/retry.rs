use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::store::{Session, StoreError};

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub steps: u32,
    pub base: Duration,
    pub factor: f64,
    /// Fraction of the delay added at random, `0.0..=jitter`.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 5,
            base: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn new(steps: u32, base: Duration) -> Self {
        Self {
            steps,
            base,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), jitter included.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt as i32);
        let jitter = if self.jitter > 0.0 {
            rand::random_range(0.0..=self.jitter)
        } else {
            0.0
        };
        let nanos = self.base.as_nanos() as f64 * exp * (1.0 + jitter);
        Duration::from_nanos(nanos.round() as u64)
    }
}

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or the attempts run out. Sleeps are cut short by the session.
pub async fn retry_on_conflict<T, F, Fut>(
    session: &Session,
    backoff: Backoff,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < steps => {
                let delay = backoff.delay(attempt);
                debug!(attempt, ?delay, error = %e, "conflict; retrying");
                session.sleep(delay).await?;
                attempt += 1;
            }
            res => return res,
        }
    }
}
