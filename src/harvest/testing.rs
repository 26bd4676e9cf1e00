//! Scripted in-memory [`Session`] used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::harvest::source::{
    FeedItem, ImageCandidate, ImageVersions, ItemOwner, Page, Session, SourceError, SourceResult,
    TrackedAccount, Tray,
};

pub fn account(id: i64, is_private: bool) -> TrackedAccount {
    TrackedAccount {
        id,
        handle: format!("user{}", id),
        is_private,
        profile_picture_url: String::new(),
    }
}

/// A feed item by `owner` with one image candidate.
pub fn feed_item(id: &str, owner: &str, captured_at: i64) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        captured_at,
        user: ItemOwner {
            username: owner.to_string(),
        },
        images: ImageVersions {
            candidates: vec![ImageCandidate {
                url: format!("https://cdn.example.com/{}/{}.jpg", owner, id),
                width: 1080,
                height: 1080,
            }],
        },
        videos: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCall {
    pub user_id: i64,
    pub cursor: Option<String>,
    pub since: Option<i64>,
}

/// A session whose pages are fixed up front.
///
/// Follow-list pages are served in order, restarting whenever no cursor is
/// given. Feeds return every scripted item regardless of `since`, mimicking
/// a source that ignores the filter.
#[derive(Default)]
pub struct FakeSession {
    handle: String,
    following: Vec<Page<TrackedAccount>>,
    following_calls: Mutex<Vec<Option<String>>>,
    following_position: Mutex<usize>,
    feeds: Mutex<HashMap<i64, Vec<FeedItem>>>,
    failing_feeds: Mutex<HashSet<i64>>,
    feed_calls: Mutex<Vec<FeedCall>>,
    tray: Mutex<Option<Tray>>,
    fail_following: bool,
    logouts: AtomicUsize,
}

impl FakeSession {
    pub fn primary(handle: &str) -> Self {
        Self {
            handle: handle.to_string(),
            tray: Mutex::new(Some(Tray::default())),
            ..Self::default()
        }
    }

    pub fn with_following(mut self, pages: Vec<Page<TrackedAccount>>) -> Self {
        self.following = pages;
        self
    }

    pub fn with_failing_following(mut self) -> Self {
        self.fail_following = true;
        self
    }

    pub fn with_tray(self, tray: Option<Tray>) -> Self {
        *self.tray.lock() = tray;
        self
    }

    pub fn set_feed(&self, user_id: i64, items: Vec<FeedItem>) {
        self.feeds.lock().insert(user_id, items);
    }

    pub fn set_feed_failing(&self, user_id: i64, failing: bool) {
        let mut failing_feeds = self.failing_feeds.lock();
        if failing {
            failing_feeds.insert(user_id);
        } else {
            failing_feeds.remove(&user_id);
        }
    }

    pub fn following_cursors(&self) -> Vec<Option<String>> {
        self.following_calls.lock().clone()
    }

    pub fn feed_calls(&self) -> Vec<FeedCall> {
        self.feed_calls.lock().clone()
    }

    pub fn logout_count(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for FakeSession {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn account_id(&self) -> i64 {
        0
    }

    async fn fetch_following(&self, cursor: Option<&str>) -> SourceResult<Page<TrackedAccount>> {
        if self.fail_following {
            return Err(SourceError::Unavailable("following".to_string()));
        }

        self.following_calls.lock().push(cursor.map(str::to_owned));

        let mut position = self.following_position.lock();
        *position = match cursor {
            None => 0,
            Some(_) => *position + 1,
        };
        let page_index = *position;
        Ok(self
            .following
            .get(page_index)
            .cloned()
            .unwrap_or_else(|| Page::last(Vec::new())))
    }

    async fn fetch_user_feed(
        &self,
        user_id: i64,
        cursor: Option<&str>,
        since: Option<i64>,
    ) -> SourceResult<Page<FeedItem>> {
        self.feed_calls.lock().push(FeedCall {
            user_id,
            cursor: cursor.map(str::to_owned),
            since,
        });

        if self.failing_feeds.lock().contains(&user_id) {
            return Err(SourceError::Unavailable(format!("feed {}", user_id)));
        }

        let items = self.feeds.lock().get(&user_id).cloned().unwrap_or_default();
        Ok(Page::last(items))
    }

    async fn fetch_story_tray(&self) -> SourceResult<Tray> {
        self.tray
            .lock()
            .clone()
            .ok_or_else(|| SourceError::Unavailable("tray".to_string()))
    }

    async fn logout(&self) -> SourceResult<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
