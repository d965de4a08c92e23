use super::challenge::{ChallengeDetector, Classification};
use super::{FetchError, FetchOutcome, PageFetcher};
use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

// ── Cookie jar file ───────────────────────────────────────────────────────────

/// One entry of the on-disk cookie jar (a JSON array). Extra fields written
/// by browser tooling (`secure`, `expiry`, …) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Missing file → empty jar.
pub fn read_cookie_jar(path: &Path) -> Result<Vec<StoredCookie>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cookie jar {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Malformed cookie jar {:?}", path))
}

pub fn write_cookie_jar(path: &Path, cookies: &[StoredCookie]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Could not create dir {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(cookies)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write cookie jar {:?}", path))
}

/// Whether `jar.cookies(root)` would report this entry for `host`.
fn sent_to_root(c: &StoredCookie, host: &str) -> bool {
    let root_path = matches!(c.path.as_deref(), None | Some("" | "/"));
    let domain = c.domain.as_deref().unwrap_or_default().trim_start_matches('.');
    root_path && (domain.is_empty() || domain == host || host.ends_with(&format!(".{domain}")))
}

/// Folds the cookies the jar sends to the site root into what is already on
/// disk. Entries the root never sees (other paths, other domains) are kept as
/// they were. Root entries take the current value, or go if the server
/// cleared them.
pub fn merge_cookie_jar(saved: Vec<StoredCookie>, current: Vec<StoredCookie>, host: &str) -> Vec<StoredCookie> {
    let mut fresh = current;
    let mut merged: Vec<StoredCookie> = saved
        .into_iter()
        .filter_map(|mut c| {
            if !sent_to_root(&c, host) {
                return Some(c);
            }
            let pos = fresh.iter().position(|f| f.name == c.name)?;
            c.value = fresh.remove(pos).value;
            Some(c)
        })
        .collect();
    merged.extend(fresh);
    merged
}

// ── HTTP fetcher ──────────────────────────────────────────────────────────────

struct Identity {
    client: reqwest::Client,
    /// Position in the user-agent / proxy pools.
    slot: usize,
}

/// Direct HTTP backend. Returns raw page text; cookies survive across
/// requests and identity rotations.
pub struct HttpFetcher {
    identity: RwLock<Identity>,
    jar: Arc<Jar>,
    config: ScraperConfig,
    base_url: Url,
    detector: ChallengeDetector,
}

impl HttpFetcher {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base URL {:?}", config.base_url))?;

        let jar = Arc::new(Jar::default());
        let fetcher = Self {
            identity: RwLock::new(Identity {
                client: build_client(config, &jar, 0)?,
                slot: 0,
            }),
            jar,
            config: config.clone(),
            base_url,
            detector: ChallengeDetector::default(),
        };

        if let Err(e) = fetcher.load_cookies() {
            warn!("Could not load cookies: {:#}", e);
        }
        Ok(fetcher)
    }

    fn jar_path(&self) -> Option<&PathBuf> {
        self.config.cookie_jar_path.as_ref()
    }

    fn load_cookies(&self) -> Result<usize> {
        let Some(path) = self.jar_path() else { return Ok(0) };
        let cookies = read_cookie_jar(path)?;
        let host = self.base_url.host_str().unwrap_or_default();

        for c in &cookies {
            let mut line = format!("{}={}; Path={}", c.name, c.value, c.path.as_deref().unwrap_or("/"));
            // Host-only unless the jar names some other (parent) domain.
            if let Some(domain) = c.domain.as_deref().map(|d| d.trim_start_matches('.')) {
                if !domain.is_empty() && domain != host {
                    line.push_str(&format!("; Domain={domain}"));
                }
            }
            self.jar.add_cookie_str(&line, &self.base_url);
        }

        if !cookies.is_empty() {
            info!("Loaded {} cookies from {:?}", cookies.len(), path);
        }
        Ok(cookies.len())
    }

    /// Cookies the jar would send to the site root.
    fn current_cookies(&self) -> Vec<StoredCookie> {
        let host = self.base_url.host_str().map(str::to_string);
        let Some(header) = self.jar.cookies(&self.base_url) else { return Vec::new() };
        let Ok(header) = header.to_str() else { return Vec::new() };

        header
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .map(|(name, value)| StoredCookie {
                name: name.to_string(),
                value: value.to_string(),
                domain: host.clone(),
                path: Some("/".to_string()),
            })
            .collect()
    }

    fn client(&self) -> reqwest::Client {
        let guard = self.identity.read().unwrap_or_else(|e| e.into_inner());
        guard.client.clone()
    }

    fn classify(&self, body: String) -> FetchOutcome {
        match self.detector.classify(&body) {
            Classification::Clean => FetchOutcome::Clean(body),
            Classification::Challenged(signal) => FetchOutcome::Challenged(signal),
        }
    }
}

fn build_client(config: &ScraperConfig, jar: &Arc<Jar>, slot: usize) -> Result<reqwest::Client> {
    let user_agent = &config.user_agents[slot % config.user_agents.len()];

    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_str(&config.accept_language)
            .with_context(|| format!("Invalid Accept-Language {:?}", config.accept_language))?,
    );

    let mut builder = reqwest::Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs))
        .gzip(true)
        .cookie_provider(Arc::clone(jar));

    if !config.proxies.is_empty() {
        let proxy = &config.proxies[slot % config.proxies.len()];
        builder = builder.proxy(
            reqwest::Proxy::all(proxy.as_str()).with_context(|| format!("Invalid proxy {:?}", proxy))?,
        );
        debug!("Using proxy slot {}", slot % config.proxies.len());
    }

    builder.build().context("Failed to build HTTP client")
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        debug!("GET {}", url);

        let resp = self.client().get(url.clone()).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Network(format!("Failed to read response body: {e}"))
            }
        })?;

        if status.is_success() {
            return Ok(self.classify(body));
        }

        // Interstitials are often served with 403/503.
        if let FetchOutcome::Challenged(signal) = self.classify(body) {
            return Ok(FetchOutcome::Challenged(signal));
        }

        match status.as_u16() {
            code @ (403 | 429) => Err(FetchError::Blocked(code)),
            code @ 408 => Err(FetchError::Network(format!("HTTP {code}"))),
            code if status.is_server_error() => Err(FetchError::Network(format!("HTTP {code}"))),
            code => Err(FetchError::Status(code)),
        }
    }

    async fn rotate_identity(&self) -> Result<bool> {
        let pool = self.config.user_agents.len().max(self.config.proxies.len());
        if pool <= 1 {
            return Ok(false);
        }

        let mut guard = self.identity.write().unwrap_or_else(|e| e.into_inner());
        let slot = (guard.slot + 1) % pool;
        guard.client = build_client(&self.config, &self.jar, slot)?;
        guard.slot = slot;
        info!("Rotated to identity slot {}/{}", slot + 1, pool);
        Ok(true)
    }

    async fn reload_session(&self) -> Result<()> {
        self.load_cookies().map(|_| ())
    }

    async fn persist_session(&self) -> Result<()> {
        let Some(path) = self.jar_path() else { return Ok(()) };
        let saved = read_cookie_jar(path).unwrap_or_else(|e| {
            warn!("Overwriting unreadable cookie jar: {:#}", e);
            Vec::new()
        });
        let host = self.base_url.host_str().unwrap_or_default();
        let cookies = merge_cookie_jar(saved, self.current_cookies(), host);
        write_cookie_jar(path, &cookies)?;
        debug!("Saved {} cookies to {:?}", cookies.len(), path);
        Ok(())
    }
}
