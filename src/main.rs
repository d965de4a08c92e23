mod config;
mod export;
mod merge;
mod models;
mod pipeline;
mod scraper;
mod utils;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

use crate::config::{AppConfig, ChallengeStrategy};
use crate::models::{League, Season, StatRequest, StatType, LEAGUES, STAT_TYPES};
use crate::pipeline::{Pipeline, ProgressEvent, Selection, SelectionError, UnitOutcome};
use crate::scraper::retry::{ChallengeAction, ChallengeHandler};

#[derive(Parser)]
#[command(name = "fbref-merge", about = "Scrape and merge fbref.com player statistics", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape every league × season × stat combination and write one merged CSV
    Scrape {
        /// League name, e.g. "Serie A" (repeat or comma-separate)
        #[arg(short, long, value_delimiter = ',')]
        league: Vec<String>,

        /// Season token, e.g. 23-24
        #[arg(short, long, value_delimiter = ',')]
        season: Vec<String>,

        /// Stat key, e.g. standard, shooting
        #[arg(short = 't', long, value_delimiter = ',')]
        stat: Vec<String>,

        /// Output CSV (default: output.csv_path from config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Ask on the terminal what to do when a challenge page shows up
        #[arg(long, conflicts_with = "on_challenge")]
        interactive: bool,

        /// Override the configured challenge strategy
        #[arg(long, value_enum)]
        on_challenge: Option<ChallengeStrategy>,
    },

    /// List supported leagues, seasons and stat types
    Catalog,

    /// Print the page URL for one league / season / stat
    Url {
        #[arg(short, long)]
        league: String,

        #[arg(short, long)]
        season: String,

        #[arg(short = 't', long)]
        stat: String,
    },
}

/// Challenge handler that asks whoever is at the terminal.
struct PromptOperator;

#[async_trait]
impl ChallengeHandler for PromptOperator {
    async fn on_challenge(&self, url: &Url, signal: &str) -> ChallengeAction {
        let prompt = format!(
            "\nChallenge at {url} ({signal}).\n\
             Solve it in the browser, then press Enter to resume. [r] rotate identity, [s] skip: "
        );
        let answer = tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => match line.trim().to_lowercase().as_str() {
                "s" | "skip" => ChallengeAction::Skip,
                "r" | "rotate" => ChallengeAction::Rotate,
                _ => ChallengeAction::Resume,
            },
            _ => {
                warn!("No answer from terminal, skipping {}", url);
                ChallengeAction::Skip
            }
        }
    }
}

fn challenge_handler(strategy: ChallengeStrategy) -> Arc<dyn ChallengeHandler> {
    match strategy {
        ChallengeStrategy::Skip => Arc::new(ChallengeAction::Skip),
        ChallengeStrategy::Rotate => Arc::new(ChallengeAction::Rotate),
        ChallengeStrategy::Prompt => Arc::new(PromptOperator),
    }
}

fn print_progress(ev: &ProgressEvent) {
    let status = match &ev.outcome {
        UnitOutcome::Folded(_) => "ok".to_string(),
        UnitOutcome::Skipped(reason) => format!("skipped ({reason})"),
    };
    eprintln!(
        "  [{:>3}/{}] {:<40} {:>8}  {}",
        ev.completed,
        ev.total,
        ev.request.to_string(),
        utils::fmt_elapsed(ev.took),
        status
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "fbref_merge=info,warn",
        1 => "fbref_merge=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    match cli.command {
        Command::Scrape { league, season, stat, output, interactive, on_challenge } => {
            let config = AppConfig::load()?;

            let selection = match Selection::new(&league, &season, &stat) {
                Ok(s) => s,
                Err(e @ SelectionError::Empty(_)) => {
                    warn!("Nothing to do: {}", e);
                    return Ok(());
                }
                Err(e) => return Err(e).context("Invalid selection"),
            };

            let strategy = if interactive {
                ChallengeStrategy::Prompt
            } else {
                on_challenge.unwrap_or_else(|| config.scraper.challenge_strategy())
            };
            info!("On challenge: {:?}", strategy);

            let output = output.unwrap_or_else(|| config.output.csv_path.clone());
            let (tx, mut rx) = mpsc::unbounded_channel();
            let printer = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    print_progress(&ev);
                }
            });

            let mut pipeline = Pipeline::new(config, challenge_handler(strategy)).with_progress(tx);
            let result = pipeline.run(&selection).await;
            drop(pipeline);
            printer.await.ok();
            let report = result.context("Scrape aborted")?;

            println!("─────────────────────────────────");
            println!("  fbref-merge: run summary");
            println!("─────────────────────────────────");
            println!("  Started   : {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("  Finished  : {}", report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("  Units     : {}", report.total);
            println!("  Merged    : {}", report.succeeded);
            println!("  Dropped   : {}", report.dropped);
            println!("  Skipped   : {}", report.skipped.len());
            println!("  Elapsed   : {}", utils::fmt_elapsed(report.elapsed));
            for (req, reason) in &report.skipped {
                println!("    - {}: {}", req, reason);
            }

            if report.is_empty() {
                println!("  No data collected, nothing written.");
            } else {
                export::write_csv(&report.table, &output)?;
                println!("  Rows      : {}", report.table.len());
                println!("  Columns   : {}", report.table.columns().len());
                println!("  Output    : {}", output.display());
                if report.is_partial() {
                    println!("  Partial result: some units failed.");
                }
            }
            println!("─────────────────────────────────");
        }

        Command::Catalog => {
            println!("Leagues:");
            for l in &LEAGUES {
                println!("  {:<16} (competition {}, slug {})", l.name, l.competition_id, l.slug);
            }
            println!("Seasons:");
            for s in Season::catalog() {
                let suffix = if s.is_current() { "  (current)" } else { "" };
                println!("  {}{}", s, suffix);
            }
            println!("Stats:");
            for t in &STAT_TYPES {
                println!("  {:<14} columns {:<16} table id *{}*", t.key, format!("{}_*", t.column_prefix), t.table_fragment);
            }
        }

        Command::Url { league, season, stat } => {
            let config = AppConfig::load()?;
            let league = League::find(&league).with_context(|| format!("Unknown league {league:?}"))?;
            let season: Season = season.parse()?;
            let stat = StatType::find(&stat).with_context(|| format!("Unknown stat {stat:?}"))?;
            let base = Url::parse(&config.scraper.base_url)
                .with_context(|| format!("Invalid base URL {:?}", config.scraper.base_url))?;
            println!("{}", StatRequest::new(league, season, stat).url(&base)?);
        }
    }

    Ok(())
}
