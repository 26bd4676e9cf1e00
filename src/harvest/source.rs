//! Source-side entities and the paginated fetch capability.
//!
//! A [`Session`] is one logged-in identity on the remote source. Everything the
//! harvester knows about the outside world comes through this trait: the
//! follow list, a user's feed, and the story tray. Entities are decoded
//! leniently; missing fields fall back to their defaults so that a malformed
//! entry simply produces no media further down the pipeline.

use std::hash::Hash;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for source fetches
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {endpoint}")]
    Status { status: u16, endpoint: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Authentication failed for {0}")]
    Auth(String),

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// An entity with a natural identity used to merge pages.
pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }

    /// A page with no continuation.
    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }

    /// The continuation cursor, with empty strings treated as end-of-stream.
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref().filter(|cursor| !cursor.is_empty())
    }
}

/// An account followed by the primary identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    #[serde(rename = "pk")]
    pub id: i64,
    #[serde(rename = "username", default)]
    pub handle: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(rename = "profile_pic_url", default)]
    pub profile_picture_url: String,
}

impl Keyed for TrackedAccount {
    type Key = i64;

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOwner {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCandidate {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVersions {
    #[serde(default)]
    pub candidates: Vec<ImageCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoVersion {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Encoding discriminator reported by the source.
    #[serde(rename = "type", default)]
    pub kind: i32,
}

/// A feed post or a single story entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    #[serde(default)]
    pub id: String,
    /// Capture time in unix seconds.
    #[serde(rename = "device_timestamp", default)]
    pub captured_at: i64,
    #[serde(default)]
    pub user: ItemOwner,
    #[serde(rename = "image_versions2", default)]
    pub images: ImageVersions,
    #[serde(rename = "video_versions", default)]
    pub videos: Vec<VideoVersion>,
}

impl Keyed for FeedItem {
    type Key = String;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// All active story entries of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reel {
    #[serde(default)]
    pub user: ItemOwner,
    #[serde(alias = "media", default)]
    pub items: Vec<FeedItem>,
}

/// The story tray across all tracked accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tray {
    #[serde(default)]
    pub tray: Vec<Reel>,
}

/// A logged-in identity able to page through the source.
#[async_trait]
pub trait Session: Send + Sync {
    /// The handle this identity is logged in as.
    fn handle(&self) -> &str;

    /// The source-side id of this identity.
    fn account_id(&self) -> i64;

    /// One page of the accounts this identity follows.
    async fn fetch_following(&self, cursor: Option<&str>) -> SourceResult<Page<TrackedAccount>>;

    /// One page of `user_id`'s feed, optionally restricted to items newer than
    /// `since` (unix seconds).
    async fn fetch_user_feed(
        &self,
        user_id: i64,
        cursor: Option<&str>,
        since: Option<i64>,
    ) -> SourceResult<Page<FeedItem>>;

    /// The current story tray.
    async fn fetch_story_tray(&self) -> SourceResult<Tray>;

    /// Release the identity on the source.
    async fn logout(&self) -> SourceResult<()>;
}
