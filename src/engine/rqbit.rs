//! librqbit-backed [TransferEngine].
//!
//! librqbit exposes a polling API rather than callbacks, so each added
//! session gets a 1s poll loop that translates stats snapshots into
//! [SessionEvent]s: one `MetadataResolved` once the torrent is initialized,
//! throttled `Progress` ticks, `Done` when all selected bytes are in,
//! `Error` for a failed torrent and `NoPeers` after a sustained window with
//! zero live peers and no progress.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session, SessionOptions,
    TorrentStatsState,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::engine::{
    AddOptions, EngineError, EngineFactory, SessionEvent, SessionEventChannel, TransferEngine,
    TransferFile, TransferSession, TransferTelemetry,
};

/// Poll ticks (1s apart) with zero live peers and no progress before a
/// session is declared peerless.
const NO_PEERS_TICKS: u32 = 60;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Settings for the production engine.
#[derive(Debug, Clone)]
pub struct RqbitSettings {
    /// Default output folder; every add overrides it with its own path.
    pub root_dir: PathBuf,
    pub enable_dht: bool,
}

impl RqbitSettings {
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            root_dir,
            enable_dht: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            root_dir: config.download_root.clone(),
            enable_dht: config.enable_dht,
        }
    }
}

pub struct RqbitEngineFactory {
    settings: RqbitSettings,
}

impl RqbitEngineFactory {
    pub fn new(settings: RqbitSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EngineFactory for RqbitEngineFactory {
    async fn create(&self) -> Result<Arc<dyn TransferEngine>, EngineError> {
        let options = SessionOptions {
            disable_dht: !self.settings.enable_dht,
            disable_dht_persistence: true,
            persistence: None,
            ..Default::default()
        };

        let session = Session::new_with_opts(self.settings.root_dir.clone(), options)
            .await
            .map_err(|e| EngineError::Construct(e.to_string()))?;

        let (fatal_tx, _) = broadcast::channel(8);

        Ok(Arc::new(RqbitEngine {
            session,
            fatal_tx,
            cancel: CancellationToken::new(),
        }))
    }
}

struct RqbitEngine {
    session: Arc<Session>,
    fatal_tx: broadcast::Sender<String>,
    /// Cancels every session poll loop this engine spawned.
    cancel: CancellationToken,
}

#[async_trait]
impl TransferEngine for RqbitEngine {
    async fn add(
        &self,
        uri: &str,
        options: AddOptions,
    ) -> Result<Arc<dyn TransferSession>, EngineError> {
        // options.max_peer_connections has no librqbit counterpart: rqbit
        // bounds peers globally, not per torrent.
        let add_options = AddTorrentOptions {
            overwrite: true,
            output_folder: Some(options.path.to_string_lossy().to_string()),
            trackers: Some(options.announce.clone()),
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(AddTorrent::from_url(uri), Some(add_options))
            .await
            .map_err(|e| EngineError::Add {
                uri: uri.to_string(),
                message: e.to_string(),
            })?;

        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => (id, handle),
            AddTorrentResponse::ListOnly(_) => {
                return Err(EngineError::Add {
                    uri: uri.to_string(),
                    message: "torrent was added in list-only mode".to_string(),
                });
            }
        };

        // The channel's buffered first receiver exists before the poll loop
        // starts, so an immediate MetadataResolved cannot be lost.
        let session = Arc::new(RqbitTransferSession {
            torrent_id: id,
            handle,
            session: self.session.clone(),
            events: SessionEventChannel::new(EVENT_CHANNEL_CAPACITY),
            selected: Mutex::new(HashSet::new()),
            cancel: self.cancel.child_token(),
        });

        tokio::spawn(poll_session(session.clone()));

        Ok(session)
    }

    fn fatal_errors(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        debug!("Transfer engine shut down");
        // session dropped with the last handle
    }
}

struct RqbitTransferSession {
    torrent_id: usize,
    handle: Arc<ManagedTorrent>,
    session: Arc<Session>,
    events: SessionEventChannel,
    selected: Mutex<HashSet<usize>>,
    cancel: CancellationToken,
}

impl RqbitTransferSession {
    async fn apply_selection(&self) -> Result<(), EngineError> {
        let selected = self.selected.lock().clone();
        self.session
            .update_only_files(&self.handle, &selected)
            .await
            .map_err(|e| EngineError::Selection(e.to_string()))
    }
}

#[async_trait]
impl TransferSession for RqbitTransferSession {
    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn files(&self) -> Vec<TransferFile> {
        let Some(metadata) = self.handle.metadata.load_full() else {
            return Vec::new();
        };

        metadata
            .file_infos
            .iter()
            .enumerate()
            .map(|(index, info)| TransferFile {
                index,
                name: info.relative_filename.to_string_lossy().to_string(),
                length: info.len,
            })
            .collect()
    }

    async fn select(&self, file_index: usize) -> Result<(), EngineError> {
        self.selected.lock().insert(file_index);
        self.apply_selection().await
    }

    async fn deselect(&self, file_index: usize) -> Result<(), EngineError> {
        self.selected.lock().remove(&file_index);
        self.apply_selection().await
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.session
            .delete(TorrentIdOrHash::Id(self.torrent_id), false)
            .await
            .map_err(|e| EngineError::Destroy(e.to_string()))
    }
}

async fn poll_session(session: Arc<RqbitTransferSession>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let mut metadata_seen = false;
    let mut peerless_ticks: u32 = 0;
    let mut last_progress_bytes: u64 = 0;

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if !metadata_seen && session.handle.metadata.load_full().is_some() {
            metadata_seen = true;
            session.events.send(SessionEvent::MetadataResolved);
        }

        let stats = session.handle.stats();

        match &stats.state {
            TorrentStatsState::Error => {
                let message = stats
                    .error
                    .clone()
                    .unwrap_or_else(|| "torrent entered error state".to_string());
                warn!(torrent_id = session.torrent_id, error = %message, "Torrent errored");
                session.events.send(SessionEvent::Error(message));
                break;
            }
            TorrentStatsState::Paused | TorrentStatsState::Initializing => continue,
            TorrentStatsState::Live => {}
        }

        if stats.finished {
            session.events.send(SessionEvent::Done);
            break;
        }

        let (speed, num_peers) = stats
            .live
            .as_ref()
            .map(|live| {
                let speed = (live.download_speed.mbps * 125_000.0) as u64;
                (speed, live.snapshot.peer_stats.live as u32)
            })
            .unwrap_or((0, 0));

        let total = stats.total_bytes.max(1);
        let progress = stats.progress_bytes as f64 / total as f64;
        let remaining = total.saturating_sub(stats.progress_bytes);
        let time_remaining = if speed > 0 {
            ((remaining as f64 / speed as f64) * 1000.0) as i64
        } else {
            0
        };

        if metadata_seen {
            if num_peers == 0 && stats.progress_bytes == last_progress_bytes {
                peerless_ticks += 1;
                if peerless_ticks >= NO_PEERS_TICKS {
                    session.events.send(SessionEvent::NoPeers);
                    break;
                }
            } else {
                peerless_ticks = 0;
            }
        }
        last_progress_bytes = stats.progress_bytes;

        if stats.progress_bytes > 0 {
            session.events.send(SessionEvent::Progress(TransferTelemetry {
                progress,
                time_remaining,
                speed,
                num_peers,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = Config::new(2, PathBuf::from("/tmp/archivist-test")).unwrap();
        let settings = RqbitSettings::from_config(&config);
        assert_eq!(settings.root_dir, PathBuf::from("/tmp/archivist-test"));
        assert!(settings.enable_dht);

        let mut no_dht = Config::new(2, PathBuf::from("/tmp/archivist-test")).unwrap();
        no_dht.enable_dht = false;
        assert!(!RqbitSettings::from_config(&no_dht).enable_dht);
    }
}
