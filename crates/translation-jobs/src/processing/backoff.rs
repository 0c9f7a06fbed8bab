//! Retry backoff for failed chunks

use rand::Rng;

use crate::config::RetryConfig;

/// Un-jittered delay before retry number `retries` (1-based):
/// `base * 2^(retries - 1)`, capped at `max`.
pub fn backoff_ms(retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponent = retries.saturating_sub(1).min(20); // Prevent overflow
    let multiplier = 2_u64.saturating_pow(exponent);
    base_delay_ms.saturating_mul(multiplier).min(max_delay_ms)
}

/// Delay before the next attempt, with ±10% jitter clamped into `[base, max]`
pub fn retry_delay(retries: u32, config: &RetryConfig) -> chrono::Duration {
    let capped = backoff_ms(retries, config.base_delay_ms, config.max_delay_ms);

    let jitter_factor = rand::thread_rng().gen_range(0.9..=1.1);
    let delay = ((capped as f64) * jitter_factor) as u64;
    let delay = delay.clamp(config.base_delay_ms, config.max_delay_ms);

    chrono::Duration::milliseconds(delay.min(i64::MAX as u64) as i64)
}
