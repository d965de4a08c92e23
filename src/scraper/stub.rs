//! In-memory fetcher for tests: a script of outcomes consumed in order, then
//! a URL → HTML map.

use super::{FetchError, FetchOutcome, PageFetcher};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

#[derive(Default)]
pub struct StubFetcher {
    script: Mutex<VecDeque<Result<FetchOutcome, FetchError>>>,
    pages: HashMap<String, String>,
    can_rotate: bool,
    calls: AtomicUsize,
    rotations: AtomicUsize,
    reloads: AtomicUsize,
    persists: AtomicUsize,
    closed: AtomicBool,
}

impl StubFetcher {
    pub fn scripted(script: Vec<Result<FetchOutcome, FetchError>>) -> Self {
        Self { script: Mutex::new(script.into()), ..Self::default() }
    }

    pub fn pages(pages: impl IntoIterator<Item = (Url, String)>) -> Self {
        Self {
            pages: pages.into_iter().map(|(u, html)| (u.to_string(), html)).collect(),
            ..Self::default()
        }
    }

    pub fn rotatable(mut self) -> Self {
        self.can_rotate = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn persists(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        self.pages
            .get(url.as_str())
            .map(|html| FetchOutcome::Clean(html.clone()))
            .ok_or(FetchError::Status(404))
    }

    async fn rotate_identity(&self) -> Result<bool> {
        if self.can_rotate {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.can_rotate)
    }

    async fn reload_session(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn persist_session(&self) -> Result<()> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
