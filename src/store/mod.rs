//! Persistence bridge for download records and media items.
//!
//! The queue core only needs a document-style store: find, create, update and
//! delete by identifier. Updates are partial: a [DownloadUpdate] replaces only
//! the named top-level fields of a record, and an [ItemDownloadUpdate] is
//! merged one level deep into the item's embedded `download` sub-document so
//! keys it does not name are preserved.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DownloadRecord, DownloadStatus, ItemType, MediaItem};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Partial update for a download record. `None` leaves a field untouched;
/// telemetry fields use a nested `Option` so they can be explicitly nulled.
#[derive(Debug, Clone, Default)]
pub struct DownloadUpdate {
    pub status: Option<DownloadStatus>,
    pub progress: Option<Option<f64>>,
    pub time_remaining: Option<Option<i64>>,
    pub speed: Option<Option<u64>>,
    pub num_peers: Option<Option<u32>>,
}

impl DownloadUpdate {
    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Status change that also clears all telemetry fields.
    pub fn status_cleared(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            progress: Some(None),
            time_remaining: Some(None),
            speed: Some(None),
            num_peers: Some(None),
        }
    }

    /// Telemetry write for an in-flight transfer.
    pub fn telemetry(progress: f64, time_remaining: i64, speed: u64, num_peers: u32) -> Self {
        Self {
            status: Some(DownloadStatus::Downloading),
            progress: Some(Some(progress)),
            time_remaining: Some(Some(time_remaining)),
            speed: Some(Some(speed)),
            num_peers: Some(Some(num_peers)),
        }
    }

    /// Terminal write for a finished transfer.
    pub fn complete() -> Self {
        Self {
            status: Some(DownloadStatus::Complete),
            progress: Some(Some(100.0)),
            time_remaining: Some(None),
            speed: Some(None),
            num_peers: Some(None),
        }
    }

    /// Apply this update to an in-memory record.
    pub fn apply(&self, record: &mut DownloadRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(time_remaining) = self.time_remaining {
            record.time_remaining = time_remaining;
        }
        if let Some(speed) = self.speed {
            record.speed = speed;
        }
        if let Some(num_peers) = self.num_peers {
            record.num_peers = num_peers;
        }
        record.updated_at = Utc::now();
    }
}

/// Merge update for a media item's `download` sub-document.
#[derive(Debug, Clone, Default)]
pub struct ItemDownloadUpdate {
    pub download_status: Option<DownloadStatus>,
    pub downloading: Option<bool>,
    pub download_complete: Option<bool>,
    pub downloaded_on: Option<DateTime<Utc>>,
}

impl ItemDownloadUpdate {
    pub fn connecting() -> Self {
        Self {
            download_status: Some(DownloadStatus::Connecting),
            downloading: Some(true),
            ..Default::default()
        }
    }

    pub fn downloading() -> Self {
        Self {
            download_status: Some(DownloadStatus::Downloading),
            downloading: Some(true),
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            download_status: Some(DownloadStatus::Failed),
            downloading: Some(false),
            ..Default::default()
        }
    }

    pub fn complete(downloaded_on: DateTime<Utc>) -> Self {
        Self {
            download_status: Some(DownloadStatus::Complete),
            downloading: Some(false),
            download_complete: Some(true),
            downloaded_on: Some(downloaded_on),
        }
    }

    /// Merge into an in-memory item: only named keys are overwritten.
    pub fn apply(&self, item: &mut MediaItem) {
        if let Some(status) = self.download_status {
            item.download.download_status = Some(status);
        }
        if let Some(downloading) = self.downloading {
            item.download.downloading = downloading;
        }
        if let Some(complete) = self.download_complete {
            item.download.download_complete = complete;
        }
        if let Some(on) = self.downloaded_on {
            item.download.downloaded_on = Some(on);
        }
        item.updated_at = Utc::now();
    }
}

/// Store for download records and the media items they belong to.
#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    async fn find_download(&self, id: &str) -> Result<Option<DownloadRecord>>;

    /// All records whose status is in `statuses` (crash-recovery seed).
    async fn downloads_with_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<DownloadRecord>>;

    async fn create_download(&self, record: &DownloadRecord) -> Result<()>;

    /// Apply a partial update and return the updated record.
    async fn update_download(&self, id: &str, update: DownloadUpdate) -> Result<DownloadRecord>;

    async fn delete_download(&self, id: &str) -> Result<()>;

    async fn find_item(&self, item_type: ItemType, id: &str) -> Result<Option<MediaItem>>;

    async fn upsert_item(&self, item: &MediaItem) -> Result<()>;

    /// Merge the update into the item's `download` sub-document.
    async fn update_item(
        &self,
        item_type: ItemType,
        id: &str,
        update: ItemDownloadUpdate,
    ) -> Result<()>;
}
