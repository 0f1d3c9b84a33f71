//! Subtitle acquisition seam.
//!
//! Triggered once per download, fire-and-forget, as soon as a transfer has
//! produced enough data for the selected file to exist on disk. The actual
//! search/download logic lives in the embedding service.

use crate::engine::TransferFile;
use crate::models::DownloadRecord;

pub trait SubtitleSearch: Send + Sync + 'static {
    /// Kick off a subtitle search for the download's selected file. Must not
    /// block; implementations spawn their own work and swallow failures.
    fn search_for_subtitles(&self, record: &DownloadRecord, file: &TransferFile);
}

/// Default implementation for deployments without a subtitle provider.
pub struct NoSubtitles;

impl SubtitleSearch for NoSubtitles {
    fn search_for_subtitles(&self, record: &DownloadRecord, file: &TransferFile) {
        tracing::debug!(
            download_id = %record.id,
            file = %file.name,
            "No subtitle provider configured, skipping search"
        );
    }
}
