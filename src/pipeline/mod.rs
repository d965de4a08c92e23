//! Pipeline orchestrator: ties fetch → extract → normalize → merge together.
//!
//! ## Run model
//!
//! One fetch backend for the whole run, opened at the start and closed on
//! every exit path. Units (league × season × stat) run strictly one after
//! another in league-major order, each one awaited to completion (backoff
//! and cooldown sleeps included) before the next starts. A failing unit is
//! logged and skipped; only a backend that cannot be opened aborts the run.
//!
//! Progress goes out on an optional channel after every unit, whatever its
//! outcome.

use crate::config::AppConfig;
use crate::merge::{Accumulator, FoldOutcome, GroupKey};
use crate::models::{DataTable, League, Season, StatRequest, StatType, ID_COLUMNS};
use crate::scraper::cleaner;
use crate::scraper::parsers::{self, ExtractError};
use crate::scraper::rate_limit::RateLimiter;
use crate::scraper::retry::{ChallengeHandler, RetryError, RetryPolicy};
use crate::scraper::{build_fetcher, PageFetcher};
use crate::utils::Timer;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

// ── Selection ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("select at least one {0}")]
    Empty(&'static str),

    #[error("unknown league {0:?}")]
    UnknownLeague(String),

    #[error("unknown season {0:?}")]
    UnknownSeason(String),

    #[error("unknown statistic {0:?}")]
    UnknownStat(String),
}

/// Validated leagues × seasons × stats. Each dimension is non-empty and
/// free of repeats; order is as given.
#[derive(Debug, Clone)]
pub struct Selection {
    leagues: Vec<&'static League>,
    seasons: Vec<Season>,
    stats: Vec<&'static StatType>,
}

fn push_unique<T: PartialEq>(v: &mut Vec<T>, item: T) {
    if !v.contains(&item) {
        v.push(item);
    }
}

impl Selection {
    pub fn new<S: AsRef<str>>(leagues: &[S], seasons: &[S], stats: &[S]) -> Result<Self, SelectionError> {
        if leagues.is_empty() {
            return Err(SelectionError::Empty("league"));
        }
        if seasons.is_empty() {
            return Err(SelectionError::Empty("season"));
        }
        if stats.is_empty() {
            return Err(SelectionError::Empty("statistic"));
        }

        let mut sel = Selection { leagues: Vec::new(), seasons: Vec::new(), stats: Vec::new() };
        for name in leagues {
            let name = name.as_ref();
            let league = League::find(name).ok_or_else(|| SelectionError::UnknownLeague(name.into()))?;
            push_unique(&mut sel.leagues, league);
        }
        for token in seasons {
            let token = token.as_ref();
            let season: Season = token
                .parse()
                .ok()
                .filter(|s| Season::catalog().contains(s))
                .ok_or_else(|| SelectionError::UnknownSeason(token.into()))?;
            push_unique(&mut sel.seasons, season);
        }
        for key in stats {
            let key = key.as_ref();
            let stat = StatType::find(key).ok_or_else(|| SelectionError::UnknownStat(key.into()))?;
            push_unique(&mut sel.stats, stat);
        }
        Ok(sel)
    }

    pub fn total(&self) -> usize {
        self.leagues.len() * self.seasons.len() * self.stats.len()
    }

    /// Units in league-major, then season, then stat order.
    pub fn requests(&self) -> Vec<StatRequest> {
        let mut out = Vec::with_capacity(self.total());
        for &league in &self.leagues {
            for &season in &self.seasons {
                for &stat in &self.stats {
                    out.push(StatRequest::new(league, season, stat));
                }
            }
        }
        out
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why one unit produced no table.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("bad URL: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Fetch(#[from] RetryError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not open fetch backend: {0:#}")]
    ResourceInit(anyhow::Error),

    #[error("invalid base URL {url:?}: {source}")]
    BaseUrl { url: String, source: url::ParseError },
}

// ── Progress & report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Folded(FoldOutcome),
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    pub request: StatRequest,
    pub outcome: UnitOutcome,
    /// Wall time of this unit, retries and cooldowns included.
    pub took: Duration,
}

#[derive(Debug)]
pub struct RunReport {
    pub table: DataTable,
    pub total: usize,
    pub succeeded: usize,
    /// Fetched and parsed, but shared no identity column with its group.
    pub dropped: usize,
    pub skipped: Vec<(StatRequest, String)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.is_empty() && (self.succeeded < self.total)
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: AppConfig,
    handler: Arc<dyn ChallengeHandler>,
    progress: Option<UnboundedSender<ProgressEvent>>,
    state: RunState,
}

impl Pipeline {
    pub fn new(config: AppConfig, handler: Arc<dyn ChallengeHandler>) -> Self {
        Self { config, handler, progress: None, state: RunState::Idle }
    }

    pub fn with_progress(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Opens the configured backend and runs every unit in `selection`.
    pub async fn run(&mut self, selection: &Selection) -> Result<RunReport, PipelineError> {
        self.state = RunState::Running;
        let fetcher = match build_fetcher(&self.config.scraper).await {
            Ok(f) => f,
            Err(e) => {
                self.state = RunState::Aborted;
                return Err(PipelineError::ResourceInit(e));
            }
        };
        self.run_with(fetcher, selection).await
    }

    /// Runs every unit against an already-open backend, then closes it.
    pub async fn run_with(
        &mut self,
        fetcher: Arc<dyn PageFetcher>,
        selection: &Selection,
    ) -> Result<RunReport, PipelineError> {
        self.state = RunState::Running;
        let result = self.drive(fetcher.as_ref(), selection).await;

        if let Err(e) = fetcher.close().await {
            warn!("Closing fetch backend failed: {:#}", e);
        }
        self.state = if result.is_ok() { RunState::Completed } else { RunState::Aborted };
        result
    }

    async fn drive(&self, fetcher: &dyn PageFetcher, selection: &Selection) -> Result<RunReport, PipelineError> {
        let base_url = &self.config.scraper.base_url;
        let base = Url::parse(base_url)
            .map_err(|source| PipelineError::BaseUrl { url: base_url.clone(), source })?;

        let limiter = RateLimiter::per_minute(self.config.scraper.max_requests_per_minute);
        let policy = RetryPolicy::from_config(&self.config.scraper, limiter);

        let started_at = Utc::now();
        let requests = selection.requests();
        let total = requests.len();
        let run_timer = Timer::start(format!("Scrape of {} units", total));

        let mut acc = Accumulator::new();
        let mut succeeded = 0usize;
        let mut dropped = 0usize;
        let mut skipped = Vec::new();

        for (i, req) in requests.iter().enumerate() {
            if i > 0 {
                self.pace().await;
            }

            let unit_timer = Timer::unit(req.to_string());
            let outcome = match self.process(fetcher, &policy, &base, req).await {
                Ok(table) => {
                    let key = GroupKey { league: req.league, season: req.season };
                    let folded = acc.fold_into(key, table, &ID_COLUMNS);
                    if folded == FoldOutcome::Dropped {
                        dropped += 1;
                    } else {
                        succeeded += 1;
                    }
                    UnitOutcome::Folded(folded)
                }
                Err(e) => {
                    warn!("{}: skipped: {}", req, e);
                    skipped.push((*req, e.to_string()));
                    UnitOutcome::Skipped(e.to_string())
                }
            };

            if let Err(e) = fetcher.persist_session().await {
                warn!("Could not persist session: {:#}", e);
            }

            let took = unit_timer.finish();
            info!("[{}/{}] {}", i + 1, total, req);
            self.emit(ProgressEvent { completed: i + 1, total, request: *req, outcome, took });
        }

        if acc.is_empty() {
            warn!("No unit produced a table");
        }
        let groups = acc.group_count();
        let table = acc.into_final();
        info!(
            "=== Done: {} ok | {} skipped | {} dropped | {} groups | {} rows ===",
            succeeded,
            skipped.len(),
            dropped,
            groups,
            table.len()
        );

        Ok(RunReport {
            table,
            total,
            succeeded,
            dropped,
            skipped,
            started_at,
            finished_at: Utc::now(),
            elapsed: run_timer.finish(),
        })
    }

    async fn process(
        &self,
        fetcher: &dyn PageFetcher,
        policy: &RetryPolicy,
        base: &Url,
        req: &StatRequest,
    ) -> Result<DataTable, UnitError> {
        let url = req.url(base)?;
        debug!("{} → {}", req, url);
        let html = policy.fetch_page(fetcher, &url, self.handler.as_ref()).await?;
        let raw = parsers::extract_table(&html, req.stat.table_fragment)?;
        Ok(cleaner::normalize(&raw, req.stat.column_prefix, &ID_COLUMNS))
    }

    async fn pace(&self) {
        let (lo, hi) = (self.config.pipeline.pacing_min_ms, self.config.pipeline.pacing_max_ms);
        let ms = if hi > lo { rand::random_range(lo..=hi) } else { lo };
        if ms > 0 {
            sleep(Duration::from_millis(ms)).await;
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            // Receiver gone means nobody is watching; the run goes on.
            let _ = tx.send(event);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cell;
    use crate::scraper::retry::ChallengeAction;
    use crate::scraper::stub::StubFetcher;
    use tokio::sync::mpsc;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.scraper.max_requests_per_minute = 1000;
        config.pipeline.pacing_min_ms = 0;
        config.pipeline.pacing_max_ms = 0;
        config
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(config(), Arc::new(ChallengeAction::Skip))
    }

    fn page(fragment: &str, stat_col: &str, value: u32) -> String {
        format!(
            r#"<html><body><table id="{fragment}">
              <thead><tr><th>Rk</th><th>Player</th><th>Squad</th><th>{stat_col}</th><th>Matches</th></tr></thead>
              <tbody><tr><th>1</th><td>X</td><td>Y</td><td>{value}</td><td>Matches</td></tr></tbody>
            </table></body></html>"#
        )
    }

    fn url_for(sel: &Selection, stat: &str) -> Url {
        let base = Url::parse("https://fbref.com").unwrap();
        sel.requests().into_iter().find(|r| r.stat.key == stat).unwrap().url(&base).unwrap()
    }

    #[test]
    fn test_selection_validation() {
        let none: [&str; 0] = [];
        assert_eq!(
            Selection::new(&none, &["23-24"], &["standard"]).unwrap_err(),
            SelectionError::Empty("league")
        );
        assert_eq!(
            Selection::new(&["Serie A"], &["16-17"], &["standard"]).unwrap_err(),
            SelectionError::UnknownSeason("16-17".into())
        );
        assert_eq!(
            Selection::new(&["Eredivisie"], &["23-24"], &["standard"]).unwrap_err(),
            SelectionError::UnknownLeague("Eredivisie".into())
        );
        assert_eq!(
            Selection::new(&["Liga"], &["23-24"], &["xg"]).unwrap_err(),
            SelectionError::UnknownStat("xg".into())
        );
    }

    #[test]
    fn test_requests_are_league_major() {
        let sel = Selection::new(&["Serie A", "Liga"], &["23-24", "22-23"], &["standard", "shooting"]).unwrap();
        let reqs = sel.requests();
        assert_eq!(reqs.len(), 8);
        assert_eq!(sel.total(), 8);
        assert!(reqs[..4].iter().all(|r| r.league.name == "Serie A"));
        assert_eq!(reqs[0].season.to_string(), "23-24");
        assert_eq!(reqs[1].stat.key, "shooting");
        assert_eq!(reqs[2].season.to_string(), "22-23");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_merge() {
        let sel = Selection::new(&["Serie A"], &["23-24"], &["standard", "shooting"]).unwrap();
        let fetcher = Arc::new(StubFetcher::pages([
            (url_for(&sel, "standard"), page("stats_standard_11", "Goals", 3)),
            (url_for(&sel, "shooting"), page("stats_shooting_11", "Shots", 10)),
        ]));

        let mut p = pipeline();
        let report = p.run_with(fetcher.clone(), &sel).await.unwrap();
        let t = &report.table;

        assert_eq!(p.state(), RunState::Completed);
        assert_eq!(t.len(), 1);
        assert_eq!(t.columns(), ["Player", "Squad", "standard_Goals", "shooting_Shots", "League", "Season"]);
        assert_eq!(t.value(0, "Player"), Some(&Cell::text("X")));
        assert_eq!(t.value(0, "Squad"), Some(&Cell::text("Y")));
        assert_eq!(t.value(0, "standard_Goals"), Some(&Cell::Int(3)));
        assert_eq!(t.value(0, "shooting_Shots"), Some(&Cell::Int(10)));
        assert_eq!(t.value(0, "League"), Some(&Cell::text("Serie A")));
        assert_eq!(t.value(0, "Season"), Some(&Cell::text("23-24")));
        assert_eq!(report.succeeded, 2);
        assert!(!report.is_partial());
        assert!(fetcher.is_closed());
        assert_eq!(fetcher.persists(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_units_are_skipped_and_progress_still_reported() {
        let sel = Selection::new(&["Serie A"], &["23-24"], &["standard", "shooting", "misc"]).unwrap();
        let fetcher = Arc::new(StubFetcher::pages([
            (url_for(&sel, "standard"), page("stats_standard_11", "Goals", 3)),
            // right page, wrong table
            (url_for(&sel, "misc"), page("stats_defense_11", "Tkl", 1)),
        ]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = pipeline().with_progress(tx);
        let report = p.run_with(fetcher.clone(), &sel).await.unwrap();
        drop(p);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.iter().map(|e| e.completed).collect::<Vec<_>>(), [1, 2, 3]);
        assert!(events.iter().all(|e| e.total == 3));
        assert!(matches!(events[1].outcome, UnitOutcome::Skipped(_)));

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.is_partial());
        assert_eq!(report.table.len(), 1);
        assert!(fetcher.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_and_unit_times_are_reported() {
        let mut config = config();
        config.pipeline.pacing_min_ms = 2000;
        config.pipeline.pacing_max_ms = 2000;
        let sel = Selection::new(&["Serie A"], &["23-24"], &["standard", "shooting"]).unwrap();
        let fetcher = Arc::new(StubFetcher::pages([
            (url_for(&sel, "standard"), page("stats_standard_11", "Goals", 3)),
            (url_for(&sel, "shooting"), page("stats_shooting_11", "Shots", 10)),
        ]));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = Pipeline::new(config, Arc::new(ChallengeAction::Skip)).with_progress(tx);
        let report = p.run_with(fetcher, &sel).await.unwrap();
        drop(p);

        // one pacing pause between the two units
        assert!(report.elapsed >= Duration::from_secs(2));
        assert!(report.finished_at >= report.started_at);
        while let Some(ev) = rx.recv().await {
            assert!(ev.took <= report.elapsed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_fetched_gives_empty_result() {
        let sel = Selection::new(&["Liga"], &["21-22"], &["gk"]).unwrap();
        let fetcher = Arc::new(StubFetcher::default());
        let report = pipeline().run_with(fetcher, &sel).await.unwrap();
        assert!(report.is_empty());
        assert!(!report.is_partial());
        assert_eq!(report.skipped.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_base_url_still_closes_backend() {
        let mut config = config();
        config.scraper.base_url = "not a url".into();
        let sel = Selection::new(&["Liga"], &["21-22"], &["gk"]).unwrap();
        let fetcher = Arc::new(StubFetcher::default());

        let mut p = Pipeline::new(config, Arc::new(ChallengeAction::Skip));
        let result = p.run_with(fetcher.clone(), &sel).await;
        assert!(matches!(result, Err(PipelineError::BaseUrl { .. })));
        assert_eq!(p.state(), RunState::Aborted);
        assert!(fetcher.is_closed());
    }

    #[cfg(not(feature = "browser"))]
    #[tokio::test]
    async fn test_backend_init_failure_aborts() {
        let mut config = config();
        config.scraper.backend = crate::config::FetchBackend::Browser;
        let sel = Selection::new(&["Liga"], &["21-22"], &["gk"]).unwrap();

        let mut p = Pipeline::new(config, Arc::new(ChallengeAction::Skip));
        assert_eq!(p.state(), RunState::Idle);
        let result = p.run(&sel).await;
        assert!(matches!(result, Err(PipelineError::ResourceInit(_))));
        assert_eq!(p.state(), RunState::Aborted);
    }
}
