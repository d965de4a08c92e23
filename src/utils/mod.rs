use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Times one scrape step. Runs on tokio's clock, so paused-clock tests see
/// the simulated time spent in backoff and pacing sleeps.
pub struct Timer {
    label: String,
    start: Instant,
    quiet: bool,
}

impl Timer {
    /// Logs start and finish at `info`.
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self { label, start: Instant::now(), quiet: false }
    }

    /// Per-unit variant; logs at `debug` only.
    pub fn unit(label: impl Into<String>) -> Self {
        let label = label.into();
        debug!("⏱  {}", label);
        Self { label, start: Instant::now(), quiet: true }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns what it measured.
    pub fn finish(self) -> Duration {
        let took = self.elapsed();
        if self.quiet {
            debug!("⏱  {} took {}", self.label, fmt_elapsed(took));
        } else {
            info!("⏱  Finished: {} (took {})", self.label, fmt_elapsed(took));
        }
        took
    }
}

/// `850ms`, `12.3s`, `4m 05s`, `1h 02m`.
pub fn fmt_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0 => format!("{}ms", d.as_millis()),
        1..=59 => format!("{:.1}s", d.as_secs_f64()),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}
