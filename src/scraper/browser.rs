//! Headless Chrome backend for when plain HTTP gets challenged.
//!
//! `headless_chrome` is blocking, so every browser call runs on the blocking
//! pool. Cookies share the on-disk jar with the HTTP backend.

use super::challenge::{ChallengeDetector, Classification};
use super::http_client::{read_cookie_jar, write_cookie_jar, StoredCookie};
use super::{FetchError, FetchOutcome, PageFetcher};
use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use url::Url;

struct Session {
    // Dropping the handle shuts the browser down.
    _browser: Browser,
    tab: Arc<Tab>,
    slot: usize,
}

pub struct BrowserFetcher {
    session: RwLock<Arc<Session>>,
    config: ScraperConfig,
    base_url: Url,
    detector: ChallengeDetector,
}

fn open_session(config: &ScraperConfig, base_url: &Url, slot: usize) -> Result<Session> {
    let lang = config.accept_language.split(',').next().unwrap_or("en-US").trim().to_string();
    let mut args: Vec<OsString> = vec![
        "--disable-blink-features=AutomationControlled".into(),
        format!("--lang={lang}").into(),
    ];
    if !config.proxies.is_empty() {
        let proxy = &config.proxies[slot % config.proxies.len()];
        args.push(format!("--proxy-server={proxy}").into());
    }

    let browser = Browser::new(LaunchOptions {
        headless: config.headless,
        window_size: Some((1920, 1080)),
        args: args.iter().map(|a| a.as_os_str()).collect(),
        idle_browser_timeout: Duration::from_secs(config.timeout_secs.max(60) * 10),
        ..Default::default()
    })
    .context("Failed to launch Chrome")?;

    let tab = browser.new_tab().context("Failed to open tab")?;
    tab.set_default_timeout(Duration::from_secs(config.timeout_secs));
    let user_agent = &config.user_agents[slot % config.user_agents.len()];
    tab.set_user_agent(user_agent, Some(&config.accept_language), None)
        .context("Failed to set user agent")?;

    if let Some(path) = &config.cookie_jar_path {
        let cookies = read_cookie_jar(path)?;
        inject_cookies(&tab, base_url, &cookies);
        if !cookies.is_empty() {
            info!("Loaded {} cookies from {:?}", cookies.len(), path);
        }
    }

    debug!("Browser session open (slot {}, headless: {})", slot, config.headless);
    Ok(Session { _browser: browser, tab, slot })
}

fn inject_cookies(tab: &Tab, base_url: &Url, cookies: &[StoredCookie]) {
    let host = base_url.host_str().unwrap_or_default().to_string();
    for c in cookies {
        let result = tab.call_method(Network::SetCookie {
            name: c.name.clone(),
            value: c.value.clone(),
            url: None,
            domain: Some(c.domain.clone().unwrap_or_else(|| host.clone())),
            path: Some(c.path.clone().unwrap_or_else(|| "/".to_string())),
            secure: None,
            http_only: None,
            same_site: None,
            expires: None,
            priority: None,
            same_party: None,
            source_scheme: None,
            source_port: None,
            partition_key: None,
        });
        if let Err(e) = result {
            warn!("Could not set cookie {}: {}", c.name, e);
        }
    }
}

fn read_cookies(tab: &Tab) -> Result<Vec<StoredCookie>> {
    let cookies = tab.get_cookies().context("Failed to read browser cookies")?;
    Ok(cookies
        .into_iter()
        .map(|c| StoredCookie { name: c.name, value: c.value, domain: Some(c.domain), path: Some(c.path) })
        .collect())
}

fn navigation_error(e: anyhow::Error) -> FetchError {
    let msg = format!("{e:#}");
    if msg.to_lowercase().contains("timeout") || msg.to_lowercase().contains("timed out") {
        FetchError::Timeout
    } else {
        FetchError::Network(msg)
    }
}

fn save_screenshot(tab: &Tab, path: &Path) -> Result<()> {
    let png = tab
        .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
        .context("Failed to capture screenshot")?;
    std::fs::write(path, png).with_context(|| format!("Failed to write {:?}", path))
}

/// Challenge signal, plus where its screenshot went if one was saved.
fn challenge_signal(signal: String, screenshot: Option<&Path>) -> String {
    match screenshot {
        Some(path) => format!("{signal}; screenshot {}", path.display()),
        None => signal,
    }
}

impl BrowserFetcher {
    pub async fn launch(config: &ScraperConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base URL {:?}", config.base_url))?;

        let (cfg, base) = (config.clone(), base_url.clone());
        let session = spawn_blocking(move || open_session(&cfg, &base, 0))
            .await
            .context("Browser launch task failed")??;

        info!("Browser backend ready");
        Ok(Self {
            session: RwLock::new(Arc::new(session)),
            config: config.clone(),
            base_url,
            detector: ChallengeDetector::default(),
        })
    }

    fn current(&self) -> Arc<Session> {
        Arc::clone(&self.session.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Best effort; a failed capture only warns.
    async fn capture_challenge(&self, session: Arc<Session>) -> Option<PathBuf> {
        let path = self.config.challenge_screenshot_path();
        let target = path.clone();
        match spawn_blocking(move || save_screenshot(&session.tab, &target)).await {
            Ok(Ok(())) => {
                info!("Challenge screenshot saved to {:?}", path);
                Some(path)
            }
            Ok(Err(e)) => {
                warn!("Challenge screenshot failed: {:#}", e);
                None
            }
            Err(e) => {
                warn!("Challenge screenshot task failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        debug!("NAVIGATE {}", url);
        let session = self.current();
        let nav = Arc::clone(&session);
        let target = url.to_string();

        let html = spawn_blocking(move || -> Result<String> {
            nav.tab.navigate_to(&target)?;
            nav.tab.wait_until_navigated()?;
            nav.tab.get_content()
        })
        .await
        .map_err(|e| FetchError::Network(format!("browser task failed: {e}")))?
        .map_err(navigation_error)?;

        if html.trim().is_empty() {
            return Err(FetchError::Network("empty page".into()));
        }
        Ok(match self.detector.classify(&html) {
            Classification::Clean => FetchOutcome::Clean(html),
            Classification::Challenged(signal) => {
                let screenshot = self.capture_challenge(session).await;
                FetchOutcome::Challenged(challenge_signal(signal, screenshot.as_deref()))
            }
        })
    }

    async fn rotate_identity(&self) -> Result<bool> {
        let pool = self.config.user_agents.len().max(self.config.proxies.len());
        if pool <= 1 {
            return Ok(false);
        }

        // Carry cookies over to the new browser.
        self.persist_session().await?;

        let slot = (self.current().slot + 1) % pool;
        let (cfg, base) = (self.config.clone(), self.base_url.clone());
        let session = spawn_blocking(move || open_session(&cfg, &base, slot))
            .await
            .context("Browser relaunch task failed")??;

        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(session);
        info!("Rotated to identity slot {}/{}", slot + 1, pool);
        Ok(true)
    }

    async fn reload_session(&self) -> Result<()> {
        let Some(path) = self.config.cookie_jar_path.clone() else { return Ok(()) };
        let session = self.current();
        let base = self.base_url.clone();
        spawn_blocking(move || -> Result<()> {
            let cookies = read_cookie_jar(&path)?;
            inject_cookies(&session.tab, &base, &cookies);
            Ok(())
        })
        .await
        .context("Cookie reload task failed")?
    }

    async fn persist_session(&self) -> Result<()> {
        let Some(path) = self.config.cookie_jar_path.clone() else { return Ok(()) };
        let session = self.current();
        let cookies = spawn_blocking(move || read_cookies(&session.tab))
            .await
            .context("Cookie read task failed")??;
        write_cookie_jar(&path, &cookies)?;
        debug!("Saved {} cookies to {:?}", cookies.len(), path);
        Ok(())
    }
}
