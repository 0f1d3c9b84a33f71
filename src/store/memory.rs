//! In-memory [MediaStore] used by tests and by embedders that run without a
//! database.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{DownloadRecord, DownloadStatus, ItemType, MediaItem};
use crate::store::{DownloadUpdate, ItemDownloadUpdate, MediaStore};

#[derive(Default)]
pub struct MemoryStore {
    downloads: RwLock<HashMap<String, DownloadRecord>>,
    movies: RwLock<HashMap<String, MediaItem>>,
    episodes: RwLock<HashMap<String, MediaItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self, item_type: ItemType) -> &RwLock<HashMap<String, MediaItem>> {
        match item_type {
            ItemType::Movie => &self.movies,
            ItemType::Episode => &self.episodes,
        }
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn find_download(&self, id: &str) -> Result<Option<DownloadRecord>> {
        Ok(self.downloads.read().get(id).cloned())
    }

    async fn downloads_with_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<DownloadRecord>> {
        Ok(self
            .downloads
            .read()
            .values()
            .filter(|record| statuses.contains(&record.status))
            .cloned()
            .collect())
    }

    async fn create_download(&self, record: &DownloadRecord) -> Result<()> {
        self.downloads
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_download(&self, id: &str, update: DownloadUpdate) -> Result<DownloadRecord> {
        let mut downloads = self.downloads.write();
        match downloads.get_mut(id) {
            Some(record) => {
                update.apply(record);
                Ok(record.clone())
            }
            None => bail!("download {} not found", id),
        }
    }

    async fn delete_download(&self, id: &str) -> Result<()> {
        self.downloads.write().remove(id);
        Ok(())
    }

    async fn find_item(&self, item_type: ItemType, id: &str) -> Result<Option<MediaItem>> {
        Ok(self.items(item_type).read().get(id).cloned())
    }

    async fn upsert_item(&self, item: &MediaItem) -> Result<()> {
        self.items(item.item_type)
            .write()
            .insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn update_item(
        &self,
        item_type: ItemType,
        id: &str,
        update: ItemDownloadUpdate,
    ) -> Result<()> {
        let mut items = self.items(item_type).write();
        match items.get_mut(id) {
            Some(item) => {
                update.apply(item);
                Ok(())
            }
            None => bail!("{} {} not found", item_type, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_partial_update_touches_only_named_fields() {
        let store = MemoryStore::new();
        let record = DownloadRecord::queued("tt1", ItemType::Movie, "1080p");
        store.create_download(&record).await.unwrap();

        let updated = store
            .update_download("tt1", DownloadUpdate::telemetry(12.34, 90_000, 1_000_000, 12))
            .await
            .unwrap();
        assert_eq!(updated.status, DownloadStatus::Downloading);
        assert_eq!(updated.progress, Some(12.34));
        assert_eq!(updated.quality, "1080p");

        let updated = store
            .update_download("tt1", DownloadUpdate::status(DownloadStatus::Failed))
            .await
            .unwrap();
        // Telemetry untouched by a status-only update
        assert_eq!(updated.progress, Some(12.34));
        assert_eq!(updated.num_peers, Some(12));
    }

    #[tokio::test]
    async fn test_item_update_merges_download_subdocument() {
        let store = MemoryStore::new();
        let item = MediaItem::new("tt2", ItemType::Episode);
        store.upsert_item(&item).await.unwrap();

        store
            .update_item(ItemType::Episode, "tt2", ItemDownloadUpdate::connecting())
            .await
            .unwrap();
        store
            .update_item(ItemType::Episode, "tt2", ItemDownloadUpdate::complete(Utc::now()))
            .await
            .unwrap();

        let item = store
            .find_item(ItemType::Episode, "tt2")
            .await
            .unwrap()
            .unwrap();
        // Merge preserved nothing-named keys and overwrote the named ones
        assert_eq!(item.download.download_status, Some(DownloadStatus::Complete));
        assert!(!item.download.downloading);
        assert!(item.download.download_complete);
        assert!(item.download.downloaded_on.is_some());
    }

    #[tokio::test]
    async fn test_downloads_with_status_filters() {
        let store = MemoryStore::new();
        for (id, status) in [
            ("tt1", DownloadStatus::Queued),
            ("tt2", DownloadStatus::Complete),
            ("tt3", DownloadStatus::Downloading),
        ] {
            let mut record = DownloadRecord::queued(id, ItemType::Movie, "720p");
            record.status = status;
            store.create_download(&record).await.unwrap();
        }

        let incomplete = store
            .downloads_with_status(DownloadStatus::INCOMPLETE)
            .await
            .unwrap();
        let mut ids: Vec<_> = incomplete.iter().map(|r| r.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, ["tt1", "tt3"]);
    }
}
