pub mod challenge;
pub mod cleaner;
pub mod http_client;
pub mod parsers;
pub mod rate_limit;
pub mod retry;

#[cfg(feature = "browser")]
pub mod browser;

#[cfg(test)]
pub mod stub;

use crate::config::{FetchBackend, ScraperConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

// ── Fetch outcome ─────────────────────────────────────────────────────────────

/// What a backend saw at a URL, when it saw anything at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Clean(String),
    /// Interstitial instead of content; carries the signal that matched.
    Challenged(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("blocked by site (HTTP {0})")]
    Blocked(u16),

    #[error("HTTP {0}")]
    Status(u16),
}

impl FetchError {
    /// Worth retrying against the same identity after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Timeout)
    }
}

// ── Fetcher trait ─────────────────────────────────────────────────────────────

/// Swappable page source. One instance serves a whole run.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError>;

    /// Switch to the next user agent / proxy. `Ok(false)` when the backend
    /// has a single identity.
    async fn rotate_identity(&self) -> Result<bool> {
        Ok(false)
    }

    /// Re-read persisted session state (after an operator solved a challenge).
    async fn reload_session(&self) -> Result<()> {
        Ok(())
    }

    async fn persist_session(&self) -> Result<()> {
        Ok(())
    }

    /// Release the backend. Called exactly once at the end of a run.
    async fn close(&self) -> Result<()> {
        self.persist_session().await
    }
}

/// Builds the backend selected by configuration.
pub async fn build_fetcher(config: &ScraperConfig) -> Result<Arc<dyn PageFetcher>> {
    match config.backend {
        FetchBackend::Http => Ok(Arc::new(http_client::HttpFetcher::new(config)?)),
        #[cfg(feature = "browser")]
        FetchBackend::Browser => Ok(Arc::new(browser::BrowserFetcher::launch(config).await?)),
        #[cfg(not(feature = "browser"))]
        FetchBackend::Browser => {
            anyhow::bail!("browser backend requested but this build lacks the `browser` feature")
        }
    }
}
