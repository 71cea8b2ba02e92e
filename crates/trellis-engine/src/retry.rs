//! Bounded-retry executor with exponential backoff.
//!
//! Every step invocation goes through a [`Retrier`]; the scheduler itself
//! performs no retries. An error surfacing from here is fatal to the run.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use trellis_graph::BoxError;

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
  /// All attempts failed; `source` is the final attempt's error.
  #[error("retries exhausted after {attempts} attempts")]
  Exhausted {
    attempts: u32,
    #[source]
    source: BoxError,
  },

  /// Cancelled before or between attempts.
  #[error("cancelled while retrying")]
  Cancelled,
}

/// Runs an attempt up to `max_retries + 1` times, sleeping
/// `base_delay * backoff_factor^(k-1)` after the k-th failure. The sleep
/// races the cancellation token.
#[derive(Debug, Clone)]
pub struct Retrier {
  max_retries: u32,
  backoff_factor: f64,
  base_delay: Duration,
}

impl Retrier {
  pub fn new(max_retries: u32, backoff_factor: f64, base_delay: Duration) -> Self {
    Self {
      max_retries,
      backoff_factor,
      base_delay,
    }
  }

  /// Drive `attempt` to a value, retrying within the budget.
  ///
  /// On success returns the value together with the number of attempts used,
  /// including the successful one.
  pub async fn run<T, F>(
    &self,
    cancel: &CancellationToken,
    mut attempt: F,
  ) -> Result<(T, u32), RetryError>
  where
    F: FnMut() -> BoxFuture<'static, Result<T, BoxError>>,
  {
    let mut attempts = 0u32;
    loop {
      if cancel.is_cancelled() {
        return Err(RetryError::Cancelled);
      }
      attempts += 1;
      match attempt().await {
        Ok(value) => return Ok((value, attempts)),
        Err(source) if attempts > self.max_retries => {
          return Err(RetryError::Exhausted { attempts, source });
        }
        Err(source) => {
          let delay = self.delay_after(attempts);
          warn!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %source,
            "attempt failed, backing off"
          );
          tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
          }
        }
      }
    }
  }

  fn delay_after(&self, failed_attempts: u32) -> Duration {
    self
      .base_delay
      .mul_f64(self.backoff_factor.powi(failed_attempts as i32 - 1))
  }
}
