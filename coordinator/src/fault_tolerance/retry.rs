//! Retry with exponential backoff and jitter
//!
//! Only errors that report themselves retryable are retried. Delays grow by
//! `backoff_multiplier` from `initial_delay`, are capped at `max_delay`, and
//! are perturbed by up to `jitter_factor` of their length in either
//! direction.

use crate::errors::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0)).min(self.config.max_delay)
    }

    /// Delay before retry number `attempt`, with jitter applied
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter = self.config.jitter_factor;
        if jitter <= 0.0 {
            return delay;
        }
        let base = delay.as_secs_f64();
        let factor = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base * (1.0 + factor)).max(0.0))
    }

    /// Run `op` until it succeeds, fails permanently or retries run out
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(target_key = %label, attempt = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        target_key = %label,
                        attempt = attempt,
                        retry_in = ?delay,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CoordinatorError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, jitter: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
            jitter_factor: jitter,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5, 0.0);
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(4), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = policy(5, 0.1);
        for _ in 0..100 {
            let d = p.delay_for(2).as_secs_f64();
            assert!((0.18..=0.22).contains(&d), "{}", d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors() {
        let calls = &AtomicU32::new(0);
        let value = policy(3, 0.0)
            .run("node", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoordinatorError::Transport("reset".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = policy(2, 0.0)
            .run("node", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoordinatorError::Transport("down".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = policy(5, 0.0)
            .run("node", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoordinatorError::CircuitOpen {
                    key: "node".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
