//! Console status line for a running harvest.

use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::harvest::download_engine::{DownloadEngine, DownloadStats};
use crate::harvest::queue::MediaReceiver;
use crate::harvest::shutdown::Shutdown;

const STATUS_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg}";

pub fn format_status(queued: usize, stats: &DownloadStats) -> String {
    format!(
        "Queue: {} | Downloaded: {} | Skipped: {} | Failed: {}",
        queued, stats.downloaded, stats.skipped, stats.failed
    )
}

fn spinner_style() -> ProgressStyle {
    match ProgressStyle::default_spinner().template(STATUS_TEMPLATE) {
        Ok(style) => style,
        Err(e) => {
            warn!("Status template rejected: {}. Using default spinner.", e);
            ProgressStyle::default_spinner()
        }
    }
}

/// Periodically redraws queue depth and download counters until shutdown.
pub struct StatusReporter {
    queue: MediaReceiver,
    engine: Arc<DownloadEngine>,
    refresh: Duration,
    progress_bar: ProgressBar,
}

impl StatusReporter {
    pub fn new(queue: MediaReceiver, engine: Arc<DownloadEngine>, refresh: Duration) -> Self {
        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(spinner_style());

        Self {
            queue,
            engine,
            refresh: refresh.max(Duration::from_millis(1)),
            progress_bar,
        }
    }

    #[cfg(test)]
    pub fn draw_target(self, target: indicatif::ProgressDrawTarget) -> Self {
        self.progress_bar.set_draw_target(target);
        self
    }

    pub fn current_message(&self) -> String {
        format_status(self.queue.len(), &self.engine.stats())
    }

    /// Run on a background task; the bar is cleared once `shutdown` fires.
    pub fn spawn(self, mut shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => {
                        self.progress_bar.set_message(self.current_message());
                        self.progress_bar.tick();
                    }
                }
            }

            self.progress_bar.finish_and_clear();
            debug!("Status reporter stopped");
        })
    }
}
