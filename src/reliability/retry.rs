//! Bounded exponential backoff for store writes.

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use std::time::Duration;

use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// `base * 2^attempt`, capped at `max_delay_ms`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(30) as i32);
        let capped = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let spread = capped * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Final result of a retried operation and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds or the budget is spent.
///
/// Sleeps the calling thread between attempts; only the writer thread uses it.
pub fn retry_blocking<F, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Attempted<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match operation() {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(e) => e,
        };
        if attempts >= config.max_attempts() {
            return Attempted {
                result: Err(err),
                attempts,
            };
        }
        let delay = config.delay_for_attempt(attempts - 1);
        log(
            Level::Warn,
            Domain::Writer,
            "write_retry",
            obj(&[
                ("operation", v_str(operation_name)),
                ("attempt", json!(attempts)),
                ("max_attempts", json!(config.max_attempts())),
                ("delay_ms", json!(delay.as_millis() as u64)),
                ("error", v_str(&err.to_string())),
            ]),
        );
        std::thread::sleep(delay);
    }
}
