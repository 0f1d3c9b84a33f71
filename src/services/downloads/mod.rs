//! Background download queue: admission, bounded dispatch, per-download
//! session orchestration and engine lifecycle.

mod service;
mod session;


pub use service::DownloadService;
