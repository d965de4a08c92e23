//! Bounded retries around a page fetch.
//!
//! Transient failures (network, timeout) back off exponentially with additive
//! jitter. Blocks and challenge pages are never retried as-is: they go to a
//! [`ChallengeHandler`], and only a rotated identity or a resumed session earns
//! another round, after a cooldown.

use super::rate_limit::RateLimiter;
use super::{FetchError, FetchOutcome, PageFetcher};
use crate::config::ScraperConfig;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{info, warn};
use url::Url;

const MAX_BACKOFF: Duration = Duration::from_secs(120);

// ── Escalation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeAction {
    /// Give up on this URL.
    Skip,
    /// Switch user agent / proxy, then retry.
    Rotate,
    /// Someone cleared the challenge out of band; reload the session and retry.
    Resume,
}

#[async_trait]
pub trait ChallengeHandler: Send + Sync {
    async fn on_challenge(&self, url: &Url, signal: &str) -> ChallengeAction;
}

/// A fixed action is the simplest handler.
#[async_trait]
impl ChallengeHandler for ChallengeAction {
    async fn on_challenge(&self, _url: &Url, _signal: &str) -> ChallengeAction {
        *self
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: FetchError },

    #[error("blocked: {0}")]
    Blocked(String),

    #[error(transparent)]
    Fetch(FetchError),
}

// ── Policy ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: u64,
    max_jitter: Duration,
    cooldown: Duration,
    max_escalations: u32,
    limiter: RateLimiter,
}

impl RetryPolicy {
    /// `limiter` should be the run-wide instance.
    pub fn from_config(config: &ScraperConfig, limiter: RateLimiter) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base.max(1),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            cooldown: Duration::from_secs(config.challenge_cooldown_secs),
            max_escalations: config.max_escalations,
            limiter,
        }
    }

    /// Delays between attempts: `base^n` seconds plus up to `max_jitter`.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        ExponentialBackoff::from_millis(self.backoff_base)
            .factor(1000)
            .max_delay(MAX_BACKOFF)
            .map(move |d| d + Duration::from_millis(rand::random_range(0..=jitter_ms)))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out. Every attempt waits on the rate limiter first.
    pub async fn with_retry<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let attempts = AtomicU32::new(0);
        let limiter = &self.limiter;

        let result = RetryIf::start(
            self.backoff(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                let fut = op();
                async move {
                    limiter.acquire().await;
                    fut.await
                }
            },
            |e: &FetchError| {
                let n = attempts.load(Ordering::Relaxed);
                let retry = e.is_transient() && n < self.max_attempts;
                if retry {
                    warn!("{} failed (attempt {}/{}): {}", label, n, self.max_attempts, e);
                }
                retry
            },
        )
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(v) => Ok(v),
            Err(e) if e.is_transient() => {
                warn!("{}: all {} attempts failed", label, attempts);
                Err(RetryError::Exhausted { attempts, last: e })
            }
            Err(e) => Err(RetryError::Fetch(e)),
        }
    }

    /// Fetches one page, escalating blocks and challenges to `handler`.
    pub async fn fetch_page(
        &self,
        fetcher: &dyn PageFetcher,
        url: &Url,
        handler: &dyn ChallengeHandler,
    ) -> Result<String, RetryError> {
        let mut escalations = 0u32;

        loop {
            let signal = match self.with_retry(url.as_str(), || fetcher.fetch(url)).await {
                Ok(FetchOutcome::Clean(html)) => return Ok(html),
                Ok(FetchOutcome::Challenged(signal)) => format!("challenge page ({signal})"),
                Err(RetryError::Fetch(FetchError::Blocked(code))) => format!("HTTP {code}"),
                Err(e) => return Err(e),
            };
            warn!("{} blocked: {}", url, signal);

            if escalations >= self.max_escalations {
                warn!("{}: escalation budget ({}) spent", url, self.max_escalations);
                return Err(RetryError::Blocked(signal));
            }
            escalations += 1;

            match handler.on_challenge(url, &signal).await {
                ChallengeAction::Skip => return Err(RetryError::Blocked(signal)),
                ChallengeAction::Rotate => match fetcher.rotate_identity().await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!("No other identity to rotate to");
                        return Err(RetryError::Blocked(signal));
                    }
                    Err(e) => {
                        warn!("Identity rotation failed: {:#}", e);
                        return Err(RetryError::Blocked(signal));
                    }
                },
                ChallengeAction::Resume => {
                    if let Err(e) = fetcher.reload_session().await {
                        warn!("Could not reload session: {:#}", e);
                    }
                }
            }

            info!("Cooling down {:?} before retrying {}", self.cooldown, url);
            sleep(self.cooldown).await;
        }
    }
}
