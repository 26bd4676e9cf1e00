//! Deduplicating traversal of paginated listings.
//!
//! The traverser keeps asking for the next page until the source stops handing
//! out cursors. Pages are merged by natural key so an entity that shows up on
//! two adjacent pages (the listing changed while we were paging) ends up in
//! the result once.

use std::collections::HashMap;
use std::future::Future;

use tracing::{debug, trace};

use crate::harvest::pacing::Jitter;
use crate::harvest::source::{FeedItem, Keyed, Page, Session, SourceResult, TrackedAccount};

/// Insertion-ordered collection with at most one entry per key.
///
/// Re-inserting a known key replaces the stored entity but keeps the position
/// where the key was first seen.
#[derive(Debug, Clone)]
pub struct KeyedCollection<E: Keyed> {
    index: HashMap<E::Key, usize>,
    entries: Vec<E>,
}

impl<E: Keyed> Default for KeyedCollection<E> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }
}

impl<E: Keyed> KeyedCollection<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one entity, returning `true` if its key was not present before.
    pub fn insert(&mut self, entity: E) -> bool {
        let key = entity.key();
        match self.index.get(&key) {
            Some(&position) => {
                self.entries[position] = entity;
                false
            }
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entity);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &E::Key) -> Option<&E> {
        self.index.get(key).map(|&position| &self.entries[position])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.entries.iter()
    }
}

impl<E: Keyed> IntoIterator for KeyedCollection<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Drive `fetch_page` from `start_cursor` until the listing is exhausted.
///
/// Sleeps one `jitter` pause between consecutive pages. The first error aborts
/// the traversal and nothing collected so far is returned.
pub async fn fetch_all<E, F, Fut>(
    mut fetch_page: F,
    start_cursor: Option<String>,
    jitter: &Jitter,
) -> SourceResult<KeyedCollection<E>>
where
    E: Keyed,
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = SourceResult<Page<E>>>,
{
    let mut collection = KeyedCollection::new();
    let mut cursor = start_cursor;
    let mut pages = 0usize;

    loop {
        let page = fetch_page(cursor.take()).await?;
        pages += 1;

        let next = page.next_cursor().map(str::to_owned);
        let mut duplicates = 0usize;
        for entity in page.items {
            if !collection.insert(entity) {
                duplicates += 1;
            }
        }
        trace!(page = pages, duplicates, total = collection.len(), "Merged page");

        match next {
            Some(next) => {
                cursor = Some(next);
                jitter.pause().await;
            }
            None => {
                debug!(pages, total = collection.len(), "Traversal complete");
                return Ok(collection);
            }
        }
    }
}

/// The complete follow list of `session`.
pub async fn following(
    session: &dyn Session,
    jitter: &Jitter,
) -> SourceResult<KeyedCollection<TrackedAccount>> {
    fetch_all(
        move |cursor: Option<String>| async move {
            session.fetch_following(cursor.as_deref()).await
        },
        None,
        jitter,
    )
    .await
}

/// Every visible feed item of `user_id`, newer than `since` where the source
/// honours it.
pub async fn feed_items(
    session: &dyn Session,
    user_id: i64,
    since: Option<i64>,
    jitter: &Jitter,
) -> SourceResult<KeyedCollection<FeedItem>> {
    fetch_all(
        move |cursor: Option<String>| async move {
            session.fetch_user_feed(user_id, cursor.as_deref(), since).await
        },
        None,
        jitter,
    )
    .await
}
