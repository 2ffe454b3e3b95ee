//! Retry backoff
//!
//! Exponential backoff with symmetric jitter, capped. The k-th retry
//! (1-based) sleeps base * 2^(k-1), jittered by +/- jitter_pct, never
//! above cap_ms.

use std::time::Duration;

use rand::Rng;

use orchestrator_config::RetryConfig;

pub fn backoff_delay(config: &RetryConfig, retry: u32) -> Duration {
    let exp = config
        .base_ms
        .saturating_mul(1u64 << retry.saturating_sub(1).min(32));
    let jitter = config.jitter_pct as f64 / 100.0;
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    let jittered = (exp as f64 * factor) as u64;
    Duration::from_millis(jittered.min(config.cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_band() {
        let config = RetryConfig::default(); // base 100, cap 2000, jitter 20%
        for retry in 1..=4u32 {
            let expected = 100u64 * (1 << (retry - 1));
            for _ in 0..50 {
                let delay = backoff_delay(&config, retry).as_millis() as u64;
                let lo = (expected as f64 * 0.8) as u64;
                let hi = ((expected as f64 * 1.2) as u64).min(2000);
                assert!(
                    delay >= lo.min(2000) && delay <= hi,
                    "retry {retry}: {delay}ms outside [{lo}, {hi}]"
                );
            }
        }
    }

    #[test]
    fn test_cap_applies() {
        let config = RetryConfig {
            base_ms: 1000,
            cap_ms: 1500,
            jitter_pct: 0,
            max_attempts: 5,
        };
        assert_eq!(backoff_delay(&config, 1).as_millis(), 1000);
        assert_eq!(backoff_delay(&config, 2).as_millis(), 1500);
        assert_eq!(backoff_delay(&config, 10).as_millis(), 1500);
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let config = RetryConfig {
            base_ms: 100,
            cap_ms: 2000,
            jitter_pct: 0,
            max_attempts: 2,
        };
        assert_eq!(backoff_delay(&config, 1).as_millis(), 100);
        assert_eq!(backoff_delay(&config, 2).as_millis(), 200);
        assert_eq!(backoff_delay(&config, 3).as_millis(), 400);
    }
}
