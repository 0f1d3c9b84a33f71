//! Core data model for the download queue.
//!
//! A [DownloadRecord] is the unit of queued work; it shares its identifier
//! with the [MediaItem] it belongs to. The item carries the candidate
//! sources the queue picks from and an embedded [ItemDownload] sub-document
//! that mirrors the record's status for catalog consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a download record.
///
/// A record belongs to the in-memory queue iff its status is one of
/// `Queued`, `Connecting` or `Downloading`. The remaining states are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Connecting,
    Downloading,
    Complete,
    Failed,
    Removed,
}

impl DownloadStatus {
    /// Statuses that keep a record in the queue (used for crash recovery).
    pub const INCOMPLETE: &'static [DownloadStatus] = &[
        DownloadStatus::Queued,
        DownloadStatus::Connecting,
        DownloadStatus::Downloading,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Complete | DownloadStatus::Failed | DownloadStatus::Removed
        )
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Connecting => "connecting",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

/// Which catalog collection a record's media item lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Movie,
    Episode,
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemType::Movie => write!(f, "movie"),
            ItemType::Episode => write!(f, "episode"),
        }
    }
}

/// Which candidate-source list the requested quality is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentType {
    Scraped,
    Searched,
}

/// Unit of queued download work. Identifier is shared with the media item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: String,
    pub item_type: ItemType,
    /// `None` is treated as [TorrentType::Scraped].
    pub torrent_type: Option<TorrentType>,
    pub quality: String,
    pub status: DownloadStatus,
    /// Percentage (0..=100), two decimals. Null outside the downloading state.
    pub progress: Option<f64>,
    /// Milliseconds. Null outside the downloading state.
    pub time_remaining: Option<i64>,
    /// Bytes per second. Null outside the downloading state.
    pub speed: Option<u64>,
    pub num_peers: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    /// New record waiting for a dispatch slot.
    pub fn queued(id: impl Into<String>, item_type: ItemType, quality: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            item_type,
            torrent_type: None,
            quality: quality.into(),
            status: DownloadStatus::Queued,
            progress: None,
            time_remaining: None,
            speed: None,
            num_peers: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One quality-tagged content locator attached to a media item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSource {
    pub quality: String,
    pub url: String,
    pub size: u64,
    pub seeds: u32,
    pub peers: u32,
    pub provider: String,
    pub language: String,
}

/// Download sub-document embedded in a media item. Updates are always a
/// merge: only named keys are overwritten, the rest are preserved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemDownload {
    pub download_status: Option<DownloadStatus>,
    pub downloading: bool,
    pub download_complete: bool,
    pub downloaded_on: Option<DateTime<Utc>>,
}

/// Movie or episode the queue downloads content for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub item_type: ItemType,
    /// Sources found by the scrapers.
    pub torrents: Vec<CandidateSource>,
    /// Sources found through a manual search.
    pub searched_torrents: Vec<CandidateSource>,
    pub download: ItemDownload,
    pub updated_at: DateTime<Utc>,
}

impl MediaItem {
    pub fn new(id: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            id: id.into(),
            item_type,
            torrents: Vec::new(),
            searched_torrents: Vec::new(),
            download: ItemDownload::default(),
            updated_at: Utc::now(),
        }
    }

    /// Candidate source matching the requested quality exactly, drawn from
    /// the list selected by the record's torrent type.
    pub fn candidate_for(&self, record: &DownloadRecord) -> Option<&CandidateSource> {
        let list = match record.torrent_type.unwrap_or(TorrentType::Scraped) {
            TorrentType::Scraped => &self.torrents,
            TorrentType::Searched => &self.searched_torrents,
        };

        list.iter().find(|source| source.quality == record.quality)
    }
}

/// Render a byte-per-second rate for progress logging.
pub fn format_speed(bytes_per_sec: u64) -> String {
    const UNITS: &[&str] = &["B/s", "kB/s", "MB/s", "GB/s"];

    let mut value = bytes_per_sec as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&DownloadStatus::Downloading).unwrap(),
            "\"downloading\""
        );
        assert_eq!(
            serde_json::from_str::<DownloadStatus>("\"complete\"").unwrap(),
            DownloadStatus::Complete
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DownloadStatus::Complete.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(DownloadStatus::Removed.is_terminal());
        assert!(!DownloadStatus::Queued.is_terminal());
        assert!(!DownloadStatus::Connecting.is_terminal());
        assert!(!DownloadStatus::Downloading.is_terminal());
    }

    #[test]
    fn test_candidate_defaults_to_scraped_list() {
        let mut item = MediaItem::new("tt0000001", ItemType::Movie);
        item.torrents.push(source("1080p", "magnet:?xt=scraped"));
        item.searched_torrents.push(source("1080p", "magnet:?xt=searched"));

        let record = DownloadRecord::queued("tt0000001", ItemType::Movie, "1080p");
        assert_eq!(item.candidate_for(&record).unwrap().url, "magnet:?xt=scraped");
    }

    #[test]
    fn test_candidate_searched_list_and_exact_quality() {
        let mut item = MediaItem::new("tt0000002", ItemType::Episode);
        item.searched_torrents.push(source("720p", "magnet:?xt=searched"));

        let mut record = DownloadRecord::queued("tt0000002", ItemType::Episode, "720p");
        record.torrent_type = Some(TorrentType::Searched);
        assert_eq!(item.candidate_for(&record).unwrap().url, "magnet:?xt=searched");

        record.quality = "1080p".to_string();
        assert!(item.candidate_for(&record).is_none());
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(512), "512.00 B/s");
        assert_eq!(format_speed(2_500_000), "2.50 MB/s");
    }

    fn source(quality: &str, url: &str) -> CandidateSource {
        CandidateSource {
            quality: quality.to_string(),
            url: url.to_string(),
            size: 700_000_000,
            seeds: 42,
            peers: 7,
            provider: "test".to_string(),
            language: "en".to_string(),
        }
    }
}
