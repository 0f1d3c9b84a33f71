//! Service layer: the download queue and its collaborators.

pub mod downloads;
pub mod subtitles;

pub use downloads::DownloadService;
pub use subtitles::{NoSubtitles, SubtitleSearch};
