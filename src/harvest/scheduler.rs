//! Harvest Scheduler
//!
//! The scheduler is the only producer of work. One cycle:
//! 1. enqueue every asset in the story tray
//! 2. re-derive the complete follow list
//! 3. per followed account, enqueue its profile picture and every feed item
//!    newer than the account's watermark, then advance the watermark
//! 4. sleep between accounts and between cycles
//!
//! Failures stay inside the unit of work that hit them: a broken tray or
//! account is logged and the cycle moves on. Only shutdown, or a closed
//! queue, stops the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::harvest::extractor;
use crate::harvest::identity::IdentityPool;
use crate::harvest::media::MediaRef;
use crate::harvest::pacing::Jitter;
use crate::harvest::queue::{MediaSender, QueueError};
use crate::harvest::shutdown::Shutdown;
use crate::harvest::source::{SourceError, TrackedAccount};
use crate::harvest::traverser;
use crate::harvest::watermark::WatermarkTable;

/// Error types for harvesting
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Failed to fetch story tray: {0}")]
    Tray(#[source] SourceError),

    #[error("Failed to fetch follow list: {0}")]
    Following(#[source] SourceError),

    #[error("Failed to fetch feed of {handle}: {source}")]
    Feed {
        handle: String,
        #[source]
        source: SourceError,
    },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Harvest interrupted by shutdown")]
    Interrupted,
}

impl HarvestError {
    /// Errors after which the scheduler cannot usefully continue.
    pub fn stops_scheduler(&self) -> bool {
        matches!(self, HarvestError::Interrupted | HarvestError::Queue(_))
    }
}

/// Result type for harvest operations
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound of the random pause between pages.
    pub max_page_jitter: Duration,
    /// Fixed pause between two accounts.
    pub account_delay: Duration,
    /// Fixed pause between two full cycles.
    pub cycle_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_page_jitter: Duration::from_secs(3),
            account_delay: Duration::from_secs(1),
            cycle_delay: Duration::from_secs(5 * 60),
        }
    }
}

/// Summary of one harvest cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub stories_enqueued: usize,
    pub accounts_harvested: usize,
    pub accounts_failed: usize,
    pub media_enqueued: usize,
}

/// Outer control loop feeding the download queue
pub struct HarvestScheduler {
    config: SchedulerConfig,
    identities: Arc<IdentityPool>,
    queue: MediaSender,
    watermarks: WatermarkTable,
    page_jitter: Jitter,
    shutdown: Shutdown,
}

impl HarvestScheduler {
    pub fn new(
        config: SchedulerConfig,
        identities: Arc<IdentityPool>,
        queue: MediaSender,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            page_jitter: Jitter::new(config.max_page_jitter),
            config,
            identities,
            queue,
            watermarks: WatermarkTable::new(),
            shutdown,
        }
    }

    #[cfg(test)]
    pub fn watermarks(&self) -> &WatermarkTable {
        &self.watermarks
    }

    /// Run cycles until shutdown. Consumes the scheduler so the queue's
    /// producer side is released when the loop ends.
    pub async fn run(mut self) -> WatermarkTable {
        info!("Scheduler started");
        let mut cycle = 0u64;

        while !self.shutdown.is_triggered() {
            cycle += 1;
            let span = info_span!("harvest_cycle", cycle);

            match self.run_cycle().instrument(span).await {
                Ok(report) => info!(
                    cycle,
                    stories = report.stories_enqueued,
                    harvested = report.accounts_harvested,
                    failed = report.accounts_failed,
                    media = report.media_enqueued,
                    "Harvest cycle complete"
                ),
                Err(e) if e.stops_scheduler() => {
                    info!("Scheduler stopping: {}", e);
                    break;
                }
                Err(e) => error!(cycle, "Harvest cycle aborted: {}", e),
            }

            if self.pause(self.config.cycle_delay).await.is_err() {
                break;
            }
        }

        info!("Scheduler stopped");
        self.watermarks
    }

    /// One full pass over the tray and every followed account.
    pub async fn run_cycle(&mut self) -> HarvestResult<CycleReport> {
        let mut report = CycleReport::default();

        info!("Checking new stories");
        match self.harvest_stories().await {
            Ok(count) => report.stories_enqueued = count,
            Err(e) if e.stops_scheduler() => return Err(e),
            Err(e) => warn!("{}", e),
        }

        let primary = Arc::clone(self.identities.primary());
        let accounts = self
            .interruptible(traverser::following(primary.as_ref(), &self.page_jitter))
            .await?
            .map_err(HarvestError::Following)?;
        info!("Tracking {} accounts", accounts.len());

        for (index, account) in accounts.into_iter().enumerate() {
            if index > 0 {
                self.pause(self.config.account_delay).await?;
            }

            match self.harvest_account(&account).await {
                Ok(count) => {
                    report.accounts_harvested += 1;
                    report.media_enqueued += count;
                }
                Err(e) if e.stops_scheduler() => return Err(e),
                Err(e) => {
                    report.accounts_failed += 1;
                    warn!(account = %account.handle, "{}", e);
                }
            }
        }

        Ok(report)
    }

    /// Enqueue every asset currently in the story tray.
    pub async fn harvest_stories(&self) -> HarvestResult<usize> {
        let primary = self.identities.primary();
        let tray = self
            .interruptible(primary.fetch_story_tray())
            .await?
            .map_err(HarvestError::Tray)?;

        self.enqueue_all(extractor::tray_media(&tray)).await
    }

    /// Enqueue everything new for one account and advance its watermark.
    ///
    /// The watermark only moves when every step succeeded; it is set to the
    /// instant the fetch began so items posted mid-harvest are seen next time.
    pub async fn harvest_account(&mut self, account: &TrackedAccount) -> HarvestResult<usize> {
        let session = Arc::clone(self.identities.for_account(account));
        info!("Using {} to get {} feed", session.handle(), account.handle);

        let mut enqueued = 0;
        if let Some(picture) = extractor::profile_picture(account) {
            self.enqueue(picture).await?;
            enqueued += 1;
        }

        let started = Utc::now();
        let since = self.watermarks.since(account.id);
        let items = self
            .interruptible(traverser::feed_items(
                session.as_ref(),
                account.id,
                since,
                &self.page_jitter,
            ))
            .await?
            .map_err(|source| HarvestError::Feed {
                handle: account.handle.clone(),
                source,
            })?;

        let fresh: Vec<MediaRef> = items
            .iter()
            .filter(|item| since.is_none_or(|mark| item.captured_at > mark))
            .flat_map(extractor::item_media)
            .collect();
        debug!(account = %account.handle, items = items.len(), media = fresh.len(), "Extracted feed media");
        enqueued += self.enqueue_all(fresh).await?;

        self.watermarks.advance(account.id, started);
        Ok(enqueued)
    }

    async fn enqueue(&self, media: MediaRef) -> HarvestResult<()> {
        self.interruptible(self.queue.enqueue(media)).await??;
        Ok(())
    }

    async fn enqueue_all(&self, media: Vec<MediaRef>) -> HarvestResult<usize> {
        let count = media.len();
        for item in media {
            self.enqueue(item).await?;
        }
        Ok(count)
    }

    /// Sleep unless shutdown arrives first.
    async fn pause(&self, delay: Duration) -> HarvestResult<()> {
        self.interruptible(tokio::time::sleep(delay)).await
    }

    /// Race `future` against the shutdown signal.
    async fn interruptible<F: std::future::Future>(&self, future: F) -> HarvestResult<F::Output> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = shutdown.triggered() => Err(HarvestError::Interrupted),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::identity::IdentitySelector;
    use crate::harvest::queue::{work_queue, MediaReceiver};
    use crate::harvest::shutdown::{shutdown_channel, ShutdownTrigger};
    use crate::harvest::source::{
        ImageCandidate, ImageVersions, ItemOwner, Page, Reel, Session, Tray,
    };
    use crate::harvest::testing::{account, feed_item, FakeSession};

    use chrono::DateTime;

    struct FirstAlternate;

    impl IdentitySelector for FirstAlternate {
        fn select(&self, _candidates: usize) -> usize {
            0
        }
    }

    struct Harness {
        scheduler: HarvestScheduler,
        receiver: MediaReceiver,
        primary: Arc<FakeSession>,
        alternate: Arc<FakeSession>,
        trigger: ShutdownTrigger,
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            max_page_jitter: Duration::ZERO,
            account_delay: Duration::ZERO,
            cycle_delay: Duration::from_secs(300),
        }
    }

    fn harness(primary: FakeSession, capacity: usize) -> Harness {
        let primary = Arc::new(primary);
        let alternate = Arc::new(FakeSession::primary("alt"));
        let identities = Arc::new(IdentityPool::new(
            primary.clone() as Arc<dyn Session>,
            vec![alternate.clone() as Arc<dyn Session>],
            Box::new(FirstAlternate),
        ));
        let (sender, receiver) = work_queue(capacity);
        let (trigger, shutdown) = shutdown_channel();

        Harness {
            scheduler: HarvestScheduler::new(fast_config(), identities, sender, shutdown),
            receiver,
            primary,
            alternate,
            trigger,
        }
    }

    async fn drain(receiver: &MediaReceiver) -> Vec<MediaRef> {
        let mut media = Vec::new();
        while !receiver.is_empty() {
            if let Some(item) = receiver.next().await {
                media.push(item);
            }
        }
        media
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn private_account_since_filter_is_exclusive() {
        let private = account(10, true);
        let main = FakeSession::primary("main").with_following(vec![Page::last(vec![private.clone()])]);
        let mut h = harness(main, 100);

        let t0 = 1_600_000_000;
        h.scheduler.watermarks.advance(10, at(t0));
        h.primary.set_feed(10, vec![
            feed_item("new", "user10", t0 + 60),
            feed_item("old", "user10", t0 - 60),
            feed_item("edge", "user10", t0),
        ]);

        let enqueued = h.scheduler.harvest_account(&private).await.unwrap();
        assert_eq!(enqueued, 1);

        let media = drain(&h.receiver).await;
        assert_eq!(media.len(), 1);
        assert!(media[0].source_url().ends_with("/new.jpg"));

        let calls = h.primary.feed_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].since, Some(t0));
        assert!(h.alternate.feed_calls().is_empty());
    }

    #[tokio::test]
    async fn public_accounts_are_fetched_by_alternate() {
        let public = account(20, false);
        let main = FakeSession::primary("main");
        let mut h = harness(main, 100);
        h.alternate.set_feed(20, vec![feed_item("p1", "user20", 1_000)]);

        let enqueued = h.scheduler.harvest_account(&public).await.unwrap();
        assert_eq!(enqueued, 1);
        assert!(h.primary.feed_calls().is_empty());
        assert_eq!(h.alternate.feed_calls()[0].since, None);
    }

    #[tokio::test]
    async fn watermark_advances_only_after_success() {
        let acc = account(30, true);
        let main = FakeSession::primary("main");
        let mut h = harness(main, 100);
        h.primary.set_feed(30, vec![feed_item("a", "user30", 1_000)]);

        h.primary.set_feed_failing(30, true);
        let result = h.scheduler.harvest_account(&acc).await;
        assert!(matches!(result, Err(HarvestError::Feed { .. })));
        assert_eq!(h.scheduler.watermarks().get(30), None);

        h.primary.set_feed_failing(30, false);
        let before = Utc::now();
        h.scheduler.harvest_account(&acc).await.unwrap();
        let first = h.scheduler.watermarks().get(30).unwrap();
        assert!(first >= before - chrono::Duration::seconds(1));

        h.primary.set_feed_failing(30, true);
        assert!(h.scheduler.harvest_account(&acc).await.is_err());
        assert_eq!(h.scheduler.watermarks().get(30), Some(first));
    }

    #[tokio::test]
    async fn profile_picture_is_enqueued_with_feed() {
        let mut acc = account(40, true);
        acc.profile_picture_url = "https://cdn.example.com/p/user40.jpg".to_string();
        let main = FakeSession::primary("main");
        let mut h = harness(main, 100);
        h.primary.set_feed(40, vec![feed_item("x", "user40", 5)]);

        assert_eq!(h.scheduler.harvest_account(&acc).await.unwrap(), 2);
        let media = drain(&h.receiver).await;
        assert_eq!(media[0].storage_path_template(), "images");
        assert_eq!(media[1].storage_path_template(), "images/1970/01/01/1080/1080");
    }

    #[tokio::test]
    async fn cycle_isolates_account_failures() {
        let accounts = vec![account(1, true), account(2, true), account(3, true)];
        let tray = Tray {
            tray: vec![Reel {
                user: ItemOwner {
                    username: "story".to_string(),
                },
                items: vec![crate::harvest::source::FeedItem {
                    id: "s".to_string(),
                    captured_at: 100,
                    user: ItemOwner::default(),
                    images: ImageVersions {
                        candidates: vec![
                            ImageCandidate {
                                url: "https://cdn.example.com/s/640.jpg".to_string(),
                                width: 640,
                                height: 640,
                            },
                            ImageCandidate {
                                url: "https://cdn.example.com/s/1080.jpg".to_string(),
                                width: 1080,
                                height: 1080,
                            },
                        ],
                    },
                    videos: Vec::new(),
                }],
            }],
        };
        let main = FakeSession::primary("main")
            .with_following(vec![Page::last(accounts)])
            .with_tray(Some(tray));
        let mut h = harness(main, 100);
        h.primary.set_feed(1, vec![feed_item("a", "user1", 10)]);
        h.primary.set_feed_failing(2, true);
        h.primary.set_feed(3, vec![feed_item("c", "user3", 10), feed_item("d", "user3", 11)]);

        let report = h.scheduler.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport {
            stories_enqueued: 2,
            accounts_harvested: 2,
            accounts_failed: 1,
            media_enqueued: 3,
        });
        assert!(h.scheduler.watermarks().get(1).is_some());
        assert!(h.scheduler.watermarks().get(2).is_none());
        assert!(h.scheduler.watermarks().get(3).is_some());
        assert_eq!(drain(&h.receiver).await.len(), 5);
    }

    #[tokio::test]
    async fn tray_failure_does_not_abort_cycle() {
        let main = FakeSession::primary("main")
            .with_following(vec![Page::last(vec![account(1, true)])])
            .with_tray(None);
        let mut h = harness(main, 100);
        h.primary.set_feed(1, vec![feed_item("a", "user1", 10)]);

        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.stories_enqueued, 0);
        assert_eq!(report.accounts_harvested, 1);
    }

    #[tokio::test]
    async fn follow_list_failure_aborts_cycle_only() {
        let main = FakeSession::primary("main").with_failing_following();
        let mut h = harness(main, 100);

        let result = h.scheduler.run_cycle().await;
        assert!(matches!(result, Err(HarvestError::Following(_))));
        assert!(!result.unwrap_err().stops_scheduler());
    }

    #[tokio::test]
    async fn shutdown_interrupts_blocked_enqueue() {
        let acc = account(1, true);
        let main = FakeSession::primary("main");
        let mut h = harness(main, 1);
        h.primary.set_feed(1, vec![feed_item("a", "user1", 10), feed_item("b", "user1", 11)]);

        let trigger = h.trigger;
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let result = h.scheduler.harvest_account(&acc).await;
        stopper.await.unwrap();

        assert!(matches!(result, Err(HarvestError::Interrupted)));
        assert_eq!(h.receiver.len(), 1);
        assert_eq!(h.scheduler.watermarks().get(1), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_and_closes_queue() {
        let main = FakeSession::primary("main")
            .with_following(vec![Page::last(vec![account(1, true)])]);
        let h = harness(main, 100);
        h.primary.set_feed(1, vec![feed_item("a", "user1", 10)]);

        let receiver = h.receiver;
        let primary = h.primary;
        let runner = tokio::spawn(h.scheduler.run());

        // let the first cycle finish and park in the cycle delay
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.trigger.trigger();

        let watermarks = runner.await.unwrap();
        assert!(watermarks.get(1).is_some());
        assert_eq!(primary.feed_calls().len(), 1);

        // producer side is gone: the queue drains then reports closed
        assert!(receiver.next().await.is_some());
        assert!(receiver.next().await.is_none());
    }
}
