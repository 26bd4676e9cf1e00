//! Media extraction from source entities.
//!
//! Every function here is total: an entity with missing or malformed media
//! lists yields fewer (possibly zero) [`MediaRef`]s, never an error.

use crate::harvest::media::{format_date_path, MediaCategory, MediaRef};
use crate::harvest::source::{FeedItem, TrackedAccount, Tray};

/// All image candidates of `item`, one per resolution.
pub fn item_images(item: &FeedItem, owner: &str) -> Vec<MediaRef> {
    let date_path = format_date_path(item.captured_at);

    item.images
        .candidates
        .iter()
        .filter(|candidate| !candidate.url.is_empty())
        .map(|candidate| {
            MediaRef::new(
                candidate.url.clone(),
                owner,
                item.captured_at,
                MediaCategory::Images,
                format!(
                    "{}/{}/{}/{}",
                    MediaCategory::Images,
                    date_path,
                    candidate.width,
                    candidate.height
                ),
            )
        })
        .collect()
}

/// All video encodings of `item`.
pub fn item_videos(item: &FeedItem, owner: &str) -> Vec<MediaRef> {
    let date_path = format_date_path(item.captured_at);

    item.videos
        .iter()
        .filter(|video| !video.url.is_empty())
        .map(|video| {
            MediaRef::new(
                video.url.clone(),
                owner,
                item.captured_at,
                MediaCategory::Videos,
                format!(
                    "{}/{}/{}/{}/{}",
                    MediaCategory::Videos,
                    date_path,
                    video.width,
                    video.height,
                    video.kind
                ),
            )
        })
        .collect()
}

/// Images followed by videos of one feed item, owned by the item's author.
pub fn item_media(item: &FeedItem) -> Vec<MediaRef> {
    if item.user.username.is_empty() {
        return Vec::new();
    }

    let mut media = item_images(item, &item.user.username);
    media.extend(item_videos(item, &item.user.username));
    media
}

/// Every story asset in the tray: all images first, then all videos.
pub fn tray_media(tray: &Tray) -> Vec<MediaRef> {
    let mut images = Vec::new();
    let mut videos = Vec::new();

    for reel in &tray.tray {
        for item in &reel.items {
            let owner = if item.user.username.is_empty() {
                reel.user.username.as_str()
            } else {
                item.user.username.as_str()
            };
            if owner.is_empty() {
                continue;
            }
            images.extend(item_images(item, owner));
            videos.extend(item_videos(item, owner));
        }
    }

    images.extend(videos);
    images
}

/// The account's current profile picture, stored without date or size
/// subdirectories.
pub fn profile_picture(account: &TrackedAccount) -> Option<MediaRef> {
    if account.profile_picture_url.is_empty() || account.handle.is_empty() {
        return None;
    }

    Some(MediaRef::new(
        account.profile_picture_url.clone(),
        account.handle.clone(),
        0,
        MediaCategory::Images,
        MediaCategory::Images.as_str(),
    ))
}
