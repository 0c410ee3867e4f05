//! Retry with exponential backoff for API requests.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::error::ApiResult;

/// Default number of attempts (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
/// Default cap on the delay between retries.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry policy shared by every request a client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      base_delay: DEFAULT_BASE_DELAY,
      max_delay: DEFAULT_MAX_DELAY,
    }
  }
}

impl RetryPolicy {
  /// Policy that never waits between attempts.
  pub fn immediate(max_attempts: u32) -> Self {
    Self {
      max_attempts,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  /// Delay before retry number `retry` (zero-based): `base * 2^retry`, capped.
  pub fn delay_for(&self, retry: u32) -> Duration {
    let factor = 1u32 << retry.min(16);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails with a non-retryable error, or the
  /// attempt budget is spent.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ApiResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_retryable() && attempt < max_attempts => {
          let delay = self.delay_for(attempt - 1);
          warn!(
            "{} failed (attempt {}/{}): {}; retrying in {:?}",
            what, attempt, max_attempts, err, delay
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
