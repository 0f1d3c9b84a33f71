//! SQLite-backed [MediaStore].
//!
//! Candidate-source lists and the embedded `download` sub-document are stored
//! as JSON columns; partial updates are read-modify-write inside a
//! transaction so the merge semantics match the in-memory store exactly.

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::models::{
    CandidateSource, DownloadRecord, DownloadStatus, ItemDownload, ItemType, MediaItem,
    TorrentType,
};
use crate::store::{DownloadUpdate, ItemDownloadUpdate, MediaStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open downloads database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                item_type TEXT NOT NULL,
                torrent_type TEXT,
                quality TEXT NOT NULL,
                status TEXT NOT NULL,
                progress REAL,
                time_remaining INTEGER,
                speed INTEGER,
                num_peers INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_items (
                id TEXT NOT NULL,
                item_type TEXT NOT NULL,
                torrents TEXT NOT NULL DEFAULT '[]',
                searched_torrents TEXT NOT NULL DEFAULT '[]',
                download TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (id, item_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn write_download(&self, record: &DownloadRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, item_type, torrent_type, quality, status,
                progress, time_remaining, speed, num_peers, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT(id) DO UPDATE SET
                item_type = excluded.item_type,
                torrent_type = excluded.torrent_type,
                quality = excluded.quality,
                status = excluded.status,
                progress = excluded.progress,
                time_remaining = excluded.time_remaining,
                speed = excluded.speed,
                num_peers = excluded.num_peers,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(record.item_type.to_string())
        .bind(record.torrent_type.map(torrent_type_str))
        .bind(&record.quality)
        .bind(record.status.to_string())
        .bind(record.progress)
        .bind(record.time_remaining)
        .bind(record.speed.map(|s| s as i64))
        .bind(record.num_peers.map(|p| p as i64))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MediaStore for SqliteStore {
    async fn find_download(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| download_from_row(&r)).transpose()
    }

    async fn downloads_with_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<DownloadRecord>> {
        // SQLite has no array binds; the status vocabulary is tiny so an
        // in-clause built from validated strings is fine here.
        let list = statuses
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");

        let rows = sqlx::query(&format!(
            "SELECT * FROM downloads WHERE status IN ({}) ORDER BY created_at",
            list
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(download_from_row).collect()
    }

    async fn create_download(&self, record: &DownloadRecord) -> Result<()> {
        self.write_download(record).await
    }

    async fn update_download(&self, id: &str, update: DownloadUpdate) -> Result<DownloadRecord> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow!("download {} not found", id))?;

        let mut record = download_from_row(&row)?;
        update.apply(&mut record);
        self.write_download(&record).await?;

        Ok(record)
    }

    async fn delete_download(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_item(&self, item_type: ItemType, id: &str) -> Result<Option<MediaItem>> {
        let row = sqlx::query("SELECT * FROM media_items WHERE id = $1 AND item_type = $2")
            .bind(id)
            .bind(item_type.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| item_from_row(&r)).transpose()
    }

    async fn upsert_item(&self, item: &MediaItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO media_items (id, item_type, torrents, searched_torrents, download, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(id, item_type) DO UPDATE SET
                torrents = excluded.torrents,
                searched_torrents = excluded.searched_torrents,
                download = excluded.download,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.id)
        .bind(item.item_type.to_string())
        .bind(serde_json::to_string(&item.torrents)?)
        .bind(serde_json::to_string(&item.searched_torrents)?)
        .bind(serde_json::to_string(&item.download)?)
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_item(
        &self,
        item_type: ItemType,
        id: &str,
        update: ItemDownloadUpdate,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM media_items WHERE id = $1 AND item_type = $2")
            .bind(id)
            .bind(item_type.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("{} {} not found", item_type, id))?;

        let mut item = item_from_row(&row)?;
        update.apply(&mut item);

        sqlx::query(
            "UPDATE media_items SET download = $1, updated_at = $2 WHERE id = $3 AND item_type = $4",
        )
        .bind(serde_json::to_string(&item.download)?)
        .bind(item.updated_at.to_rfc3339())
        .bind(id)
        .bind(item_type.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn torrent_type_str(t: TorrentType) -> &'static str {
    match t {
        TorrentType::Scraped => "scraped",
        TorrentType::Searched => "searched",
    }
}

fn status_from_str(s: &str) -> Result<DownloadStatus> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| anyhow!("unknown download status '{}'", s))
}

fn datetime_from_str(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::from_str(s).map(|dt: DateTime<chrono::FixedOffset>| dt.with_timezone(&Utc))?)
}

fn download_from_row(row: &SqliteRow) -> Result<DownloadRecord> {
    let item_type: String = row.try_get("item_type")?;
    let torrent_type: Option<String> = row.try_get("torrent_type")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DownloadRecord {
        id: row.try_get("id")?,
        item_type: match item_type.as_str() {
            "movie" => ItemType::Movie,
            _ => ItemType::Episode,
        },
        torrent_type: torrent_type.as_deref().map(|t| match t {
            "searched" => TorrentType::Searched,
            _ => TorrentType::Scraped,
        }),
        quality: row.try_get("quality")?,
        status: status_from_str(&status)?,
        progress: row.try_get("progress")?,
        time_remaining: row.try_get("time_remaining")?,
        speed: row.try_get::<Option<i64>, _>("speed")?.map(|s| s as u64),
        num_peers: row
            .try_get::<Option<i64>, _>("num_peers")?
            .map(|p| p as u32),
        created_at: datetime_from_str(&created_at)?,
        updated_at: datetime_from_str(&updated_at)?,
    })
}

fn item_from_row(row: &SqliteRow) -> Result<MediaItem> {
    let item_type: String = row.try_get("item_type")?;
    let torrents: String = row.try_get("torrents")?;
    let searched: String = row.try_get("searched_torrents")?;
    let download: String = row.try_get("download")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(MediaItem {
        id: row.try_get("id")?,
        item_type: match item_type.as_str() {
            "movie" => ItemType::Movie,
            _ => ItemType::Episode,
        },
        torrents: serde_json::from_str::<Vec<CandidateSource>>(&torrents)?,
        searched_torrents: serde_json::from_str::<Vec<CandidateSource>>(&searched)?,
        download: serde_json::from_str::<ItemDownload>(&download)?,
        updated_at: datetime_from_str(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(dir.path().join("archivist.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_download_round_trip_and_partial_update() {
        let (_dir, store) = temp_store().await;

        let record = DownloadRecord::queued("tt100", ItemType::Movie, "1080p");
        store.create_download(&record).await.unwrap();

        let found = store.find_download("tt100").await.unwrap().unwrap();
        assert_eq!(found.status, DownloadStatus::Queued);
        assert_eq!(found.quality, "1080p");

        let updated = store
            .update_download("tt100", DownloadUpdate::telemetry(55.5, 1200, 900, 8))
            .await
            .unwrap();
        assert_eq!(updated.status, DownloadStatus::Downloading);
        assert_eq!(updated.speed, Some(900));

        let updated = store
            .update_download("tt100", DownloadUpdate::complete())
            .await
            .unwrap();
        assert_eq!(updated.progress, Some(100.0));
        assert_eq!(updated.speed, None);
        assert_eq!(updated.num_peers, None);
    }

    #[tokio::test]
    async fn test_status_filter_and_delete() {
        let (_dir, store) = temp_store().await;

        let mut a = DownloadRecord::queued("tt1", ItemType::Movie, "720p");
        let mut b = DownloadRecord::queued("tt2", ItemType::Episode, "720p");
        b.status = DownloadStatus::Failed;
        a.status = DownloadStatus::Connecting;
        store.create_download(&a).await.unwrap();
        store.create_download(&b).await.unwrap();

        let incomplete = store
            .downloads_with_status(DownloadStatus::INCOMPLETE)
            .await
            .unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "tt1");

        store.delete_download("tt1").await.unwrap();
        assert!(store.find_download("tt1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_item_download_merge_persists() {
        let (_dir, store) = temp_store().await;

        let mut item = MediaItem::new("tt200", ItemType::Episode);
        item.torrents.push(CandidateSource {
            quality: "720p".to_string(),
            url: "magnet:?xt=abc".to_string(),
            size: 1,
            seeds: 1,
            peers: 1,
            provider: "test".to_string(),
            language: "en".to_string(),
        });
        store.upsert_item(&item).await.unwrap();

        store
            .update_item(ItemType::Episode, "tt200", ItemDownloadUpdate::downloading())
            .await
            .unwrap();
        store
            .update_item(
                ItemType::Episode,
                "tt200",
                ItemDownloadUpdate::complete(Utc::now()),
            )
            .await
            .unwrap();

        let item = store
            .find_item(ItemType::Episode, "tt200")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.download.download_status, Some(DownloadStatus::Complete));
        assert!(item.download.download_complete);
        // Non-download columns untouched by the merge
        assert_eq!(item.torrents.len(), 1);
    }
}
