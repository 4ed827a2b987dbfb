//! Admission control shared by every connection of a server

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::Error;

/// Token bucket refilled continuously at `refill_per_sec`
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A full bucket of `capacity` tokens
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or fail with 429 when the bucket is empty
    pub fn try_acquire(&self) -> Result<(), Error> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(
            self.capacity
        );
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            return Err(Error::RateLimited("rate limit exceeded".to_string()));
        }
        bucket.tokens -= 1.0;
        Ok(())
    }

    /// Time until the next token is available
    pub fn retry_after(&self) -> Duration {
        let bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        if bucket.tokens >= 1.0 || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_empties_and_refills() {
        let limiter = RateLimiter::new(2, 1.0);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.try_acquire().unwrap_err().code(), 429);
        assert!(limiter.retry_after() > Duration::ZERO);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }
}
