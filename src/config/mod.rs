use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchBackend {
    #[default]
    Http,
    Browser,
}

/// What to do when a page turns out to be a bot challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStrategy {
    Skip,
    Rotate,
    Prompt,
}

/// Scraper configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub backend: FetchBackend,
    pub timeout_secs: u64,
    pub max_requests_per_minute: u32,
    pub max_attempts: u32,
    /// Transient failures sleep `backoff_base^attempt` seconds plus jitter.
    pub backoff_base: u64,
    pub max_jitter_ms: u64,
    pub challenge_cooldown_secs: u64,
    /// Identity rotations / operator resumes allowed per request.
    pub max_escalations: u32,
    pub user_agents: Vec<String>,
    pub accept_language: String,
    pub proxies: Vec<String>,
    pub headless: bool,
    pub cookie_jar_path: Option<PathBuf>,
    pub on_challenge: Option<ChallengeStrategy>,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Randomized pause between units, in milliseconds.
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub csv_path: PathBuf,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

const CHALLENGE_SCREENSHOT: &str = "last_challenge.png";

const USER_AGENT_POOL: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_6) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0",
];

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fbref.com".to_string(),
            backend: FetchBackend::Http,
            timeout_secs: 30,
            max_requests_per_minute: 30,
            max_attempts: 4,
            backoff_base: 2,
            max_jitter_ms: 1500,
            challenge_cooldown_secs: 60,
            max_escalations: 2,
            user_agents: USER_AGENT_POOL.iter().map(|s| s.to_string()).collect(),
            accept_language: "en-US,en;q=0.9".to_string(),
            proxies: Vec::new(),
            headless: true,
            cookie_jar_path: Some(PathBuf::from("./cookie_jar_fbref.json")),
            on_challenge: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { pacing_min_ms: 1200, pacing_max_ms: 3200 }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { csv_path: PathBuf::from("fbref_merged.csv") }
    }
}

impl ScraperConfig {
    /// Explicit setting, else prompt when a human is watching, else rotate
    /// when there is anything to rotate to.
    pub fn challenge_strategy(&self) -> ChallengeStrategy {
        self.on_challenge.unwrap_or_else(|| {
            if !self.headless {
                ChallengeStrategy::Prompt
            } else if self.user_agents.len() > 1 || self.proxies.len() > 1 {
                ChallengeStrategy::Rotate
            } else {
                ChallengeStrategy::Skip
            }
        })
    }

    /// Where the browser backend saves the last challenge it ran into: next to
    /// the cookie jar, or the working directory without one.
    #[cfg_attr(not(feature = "browser"), allow(dead_code))]
    pub fn challenge_screenshot_path(&self) -> PathBuf {
        let dir = self
            .cookie_jar_path
            .as_deref()
            .and_then(|p| p.parent())
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        dir.join(CHALLENGE_SCREENSHOT)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("FBREF")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("scraper.proxies"),
            )
            .build()?;

        let mut app_cfg: AppConfig = cfg.try_deserialize().context("Invalid configuration")?;
        app_cfg.apply_flat_env(|key| std::env::var(key).ok())?;
        app_cfg.validate()?;
        debug!("Configuration: {:?}", app_cfg);
        Ok(app_cfg)
    }

    /// Flat variables kept for deployments that predate the `FBREF__` scheme:
    /// MAX_REQ_PER_MINUTE, COOKIE_JAR_PATH, PROXY_URL, HEADLESS, ACCEPT_LANGUAGE.
    fn apply_flat_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let s = &mut self.scraper;
        if let Some(v) = var("MAX_REQ_PER_MINUTE") {
            s.max_requests_per_minute = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_REQ_PER_MINUTE={v:?} is not a number"))?;
        }
        if let Some(v) = var("COOKIE_JAR_PATH") {
            s.cookie_jar_path = if v.trim().is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = var("PROXY_URL") {
            let v = v.trim();
            if !v.is_empty() {
                s.proxies = vec![v.to_string()];
            }
        }
        if let Some(v) = var("HEADLESS") {
            s.headless = v.trim() == "1";
        }
        if let Some(v) = var("ACCEPT_LANGUAGE") {
            s.accept_language = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let s = &self.scraper;
        if s.max_requests_per_minute == 0 {
            bail!("scraper.max_requests_per_minute must be at least 1");
        }
        if s.max_attempts == 0 {
            bail!("scraper.max_attempts must be at least 1");
        }
        if s.user_agents.is_empty() {
            bail!("scraper.user_agents must not be empty");
        }
        if self.pipeline.pacing_min_ms > self.pipeline.pacing_max_ms {
            bail!("pipeline.pacing_min_ms exceeds pipeline.pacing_max_ms");
        }
        Ok(())
    }
}
