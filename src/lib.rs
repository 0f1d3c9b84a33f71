//! Archivist download core.
//!
//! Background acquisition queue for a media server: records queued against a
//! movie or episode are dispatched with bounded concurrency, each driving one
//! transfer session on a shared lazily-created peer-to-peer engine, with
//! status and telemetry persisted through a pluggable store.

pub mod config;
pub mod engine;
pub mod logging;
pub mod models;
pub mod services;
pub mod store;

pub use config::Config;
pub use services::{DownloadService, NoSubtitles, SubtitleSearch};
pub use store::MediaStore;
