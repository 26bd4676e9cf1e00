//! The normalized description of one downloadable asset and the rules that
//! map it onto the filesystem.
//!
//! Destination paths are a pure function of a [`MediaRef`]. Their existence on
//! disk is the only record of what has already been downloaded.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use reqwest::Url;
use thiserror::Error;

/// Error types for media path resolution
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Invalid media URL: {0}")]
    InvalidUrl(String),

    #[error("Media URL has no file name: {0}")]
    MissingFileName(String),

    #[error("Media has no owner: {0}")]
    MissingOwner(String),
}

/// Result type for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Top-level category directory of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCategory {
    Images,
    Videos,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Images => "images",
            MediaCategory::Videos => "videos",
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable asset discovered by the harvester
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaRef {
    source_url: String,
    owner_handle: String,
    captured_at: i64,
    category: MediaCategory,
    storage_path_template: String,
}

impl MediaRef {
    pub fn new(
        source_url: impl Into<String>,
        owner_handle: impl Into<String>,
        captured_at: i64,
        category: MediaCategory,
        storage_path_template: impl Into<String>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            owner_handle: owner_handle.into(),
            captured_at,
            category,
            storage_path_template: storage_path_template.into(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn owner_handle(&self) -> &str {
        &self.owner_handle
    }

    #[cfg(test)]
    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn category(&self) -> MediaCategory {
        self.category
    }

    #[cfg(test)]
    pub fn storage_path_template(&self) -> &str {
        &self.storage_path_template
    }

    /// Last segment of the URL path, query string excluded.
    pub fn file_name(&self) -> MediaResult<String> {
        let url = Url::parse(&self.source_url)
            .map_err(|_| MediaError::InvalidUrl(self.source_url.clone()))?;

        url.path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| MediaError::MissingFileName(self.source_url.clone()))
    }

    /// `{owner}/{template}/{YYYYMMDD_HHMMSS}_{file name}`
    pub fn relative_path(&self) -> MediaResult<PathBuf> {
        let owner = sanitize_component(&self.owner_handle);
        if owner.is_empty() {
            return Err(MediaError::MissingOwner(self.source_url.clone()));
        }

        let file_name = format!(
            "{}_{}",
            format_file_timestamp(self.captured_at),
            sanitize_component(&self.file_name()?)
        );

        let mut path = PathBuf::from(owner);
        for segment in self.storage_path_template.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path.push(file_name);
        Ok(path)
    }

    /// Absolute destination under the download root.
    pub fn destination(&self, root: &Path) -> MediaResult<PathBuf> {
        Ok(root.join(self.relative_path()?))
    }
}

/// UTC instant of a unix timestamp, clamped to the epoch when out of range.
pub fn timestamp_to_datetime(unix_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(unix_secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

/// `YYYY/MM/DD` date directory for a capture time.
pub fn format_date_path(unix_secs: i64) -> String {
    timestamp_to_datetime(unix_secs).format("%Y/%m/%d").to_string()
}

/// `YYYYMMDD_HHMMSS` file name prefix for a capture time.
pub fn format_file_timestamp(unix_secs: i64) -> String {
    timestamp_to_datetime(unix_secs).format("%Y%m%d_%H%M%S").to_string()
}

fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}
