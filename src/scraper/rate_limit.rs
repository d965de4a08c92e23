//! Leaky-bucket rate limiter shared by every fetch in a run.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::info;

/// Token state. `allowance` refills at `capacity / 60` per second, capped at
/// `capacity`.
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    allowance: f64,
    last_check: Instant,
}

impl Bucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self { capacity, allowance: capacity, last_check: now }
    }

    /// Takes one token. Returns how long the caller must wait before the
    /// token is really theirs, or `None` if it was available.
    fn take(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_check).as_secs_f64();
        self.last_check = now;
        self.allowance = (self.allowance + elapsed * self.capacity / 60.0).min(self.capacity);

        if self.allowance >= 1.0 {
            self.allowance -= 1.0;
            return None;
        }

        let wait = Duration::from_secs_f64((1.0 - self.allowance) * 60.0 / self.capacity);
        // The token is granted at the end of the wait.
        self.allowance = 0.0;
        self.last_check = now + wait;
        Some(wait)
    }
}

/// Cheap to clone; clones share one bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn per_minute(max_requests: u32) -> Self {
        Self { bucket: Arc::new(Mutex::new(Bucket::new(max_requests, Instant::now()))) }
    }

    /// Waits for a slot. Returns the time spent waiting (zero if none).
    pub async fn acquire(&self) -> Duration {
        let wait = self.bucket.lock().await.take(Instant::now());
        match wait {
            Some(wait) => {
                info!("Rate limiter: sleeping {:.2?} to respect rate limit", wait);
                sleep(wait).await;
                wait
            }
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_plus_one_forces_exactly_one_wait() {
        let now = Instant::now();
        let mut bucket = Bucket::new(5, now);
        let waits: Vec<Option<Duration>> = (0..6).map(|_| bucket.take(now)).collect();

        assert!(waits[..5].iter().all(Option::is_none));
        assert_eq!(waits[5], Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_refills_over_time() {
        let now = Instant::now();
        let mut bucket = Bucket::new(60, now);
        for _ in 0..60 {
            assert!(bucket.take(now).is_none());
        }
        assert!(bucket.take(now + Duration::from_secs(1)).is_none());
        assert!(bucket.take(now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_allowance_is_capped() {
        let now = Instant::now();
        let mut bucket = Bucket::new(2, now);
        let later = now + Duration::from_secs(3600);
        assert!(bucket.take(later).is_none());
        assert!(bucket.take(later).is_none());
        assert!(bucket.take(later).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_sleeps_once() {
        let limiter = RateLimiter::per_minute(3);
        let clone = limiter.clone();

        let mut waited = Vec::new();
        for i in 0..4 {
            let l = if i % 2 == 0 { &limiter } else { &clone };
            waited.push(l.acquire().await);
        }
        let forced: Vec<_> = waited.iter().filter(|w| !w.is_zero()).collect();
        assert_eq!(forced.len(), 1);
        assert!(!waited[3].is_zero());
    }
}
