//! Per-`server_id` token-bucket rate limiter. Continuous
//! refill, not slotted: elapsed time since the bucket's last touch is
//! converted straight into fractional tokens.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub rate: f64,
    pub burst: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    config: BucketConfig,
}

pub struct RateLimited {
    pub retry_after_ms: u64,
}

pub struct RateLimiter {
    default_config: BucketConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(default_config: BucketConfig) -> Self {
        Self { default_config, buckets: DashMap::new() }
    }

    /// Swaps a specific server's bucket configuration; the bucket itself is
    /// created lazily on first `consume`.
    pub fn configure(&self, server_id: &str, config: BucketConfig) {
        match self.buckets.get_mut(server_id) {
            Some(mut bucket) => bucket.config = config,
            None => {
                self.buckets.insert(
                    server_id.to_string(),
                    Bucket { tokens: config.burst, last_refill: Instant::now(), config },
                );
            }
        }
    }

    pub fn consume(&self, server_id: &str) -> Result<(), RateLimited> {
        let mut bucket = self.buckets.entry(server_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.default_config.burst,
            last_refill: Instant::now(),
            config: self.default_config,
        });

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.config.rate).min(bucket.config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_ms = ((deficit / bucket.config.rate) * 1000.0).ceil().max(0.0) as u64;
            Err(RateLimited { retry_after_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_of_b_calls_succeeds_then_the_next_is_denied() {
        let limiter = RateLimiter::new(BucketConfig { rate: 10.0, burst: 3.0 });
        for _ in 0..3 {
            assert!(limiter.consume("s1").is_ok());
        }
        assert!(limiter.consume("s1").is_err());
    }

    #[test]
    fn retry_after_is_roughly_one_second_over_rate() {
        let limiter = RateLimiter::new(BucketConfig { rate: 10.0, burst: 1.0 });
        assert!(limiter.consume("s1").is_ok());
        let err = limiter.consume("s1").unwrap_err();
        assert!(err.retry_after_ms > 0 && err.retry_after_ms <= 110);
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(BucketConfig { rate: 1000.0, burst: 1.0 });
        assert!(limiter.consume("s1").is_ok());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.consume("s1").is_ok());
    }

    #[test]
    fn distinct_servers_have_independent_buckets() {
        let limiter = RateLimiter::new(BucketConfig { rate: 10.0, burst: 1.0 });
        assert!(limiter.consume("s1").is_ok());
        assert!(limiter.consume("s2").is_ok());
    }
}
