//! Bounded collaborator calls
//!
//! Every external I/O call in the pipeline goes through [`bounded`] (timeout
//! on each attempt, a fixed number of retries) so a slow or failing backend
//! can never stall presence processing. [`Backoff`] drives the watcher's
//! subscription retry loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Run `f` with a per-attempt timeout, retrying up to `retries` more times
///
/// Retries are immediate; callers in the processing pipeline must not sleep.
pub async fn bounded<F, Fut, T>(
    operation: &'static str,
    timeout: Duration,
    retries: u32,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let err = match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout {
                operation,
                after: timeout,
            },
        };

        if attempt >= retries {
            return Err(err);
        }
        attempt += 1;

        tracing::debug!(
            operation = operation,
            attempt = attempt,
            retries = retries,
            error = %err,
            "Retrying collaborator call"
        );
    }
}

/// Exponential backoff with +/-30% jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            jitter: true,
        }
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
            base.mul_f64(factor)
        } else {
            base
        }
    }

    /// Restart the schedule after a success
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
