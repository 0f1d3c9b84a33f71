//! Transfer engine seam.
//!
//! The queue core treats the peer-to-peer engine as an opaque resource: it
//! asks for a session by URI, listens for session events, selects one file,
//! and destroys sessions and the engine when work runs out. The production
//! implementation lives in [rqbit]; tests script a mock against the same
//! traits.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

pub mod rqbit;

#[cfg(test)]
pub(crate) mod mock;

pub use rqbit::{RqbitEngineFactory, RqbitSettings};

/// Per-session peer connection bound passed on every add.
pub const MAX_SESSION_PEER_CONNECTIONS: usize = 5;

/// Announce hints sent with every added session.
pub const TRACKERS: &[&str] = &[
    "udp://glotorrents.pw:6969",
    "udp://tracker.opentrackr.org:1337",
    "udp://torrent.gresille.org:80",
    "udp://tracker.openbittorrent.com:1337",
    "udp://tracker.coppersurfer.tk:6969",
    "udp://tracker.leechers-paradise.org:6969",
    "udp://p4p.arenabg.ch:1337",
    "udp://p4p.arenabg.com:1337",
    "udp://tracker.internetwarriors.net:1337",
    "udp://9.rarbg.to:2710",
    "udp://9.rarbg.me:2710",
    "udp://exodus.desync.com:6969",
    "udp://tracker.cyberia.is:6969",
    "udp://tracker.torrent.eu.org:451",
    "udp://tracker.open-internet.nl:6969",
];

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to construct transfer engine: {0}")]
    Construct(String),

    #[error("failed to add transfer for '{uri}': {message}")]
    Add { uri: String, message: String },

    #[error("failed to update file selection: {0}")]
    Selection(String),

    #[error("failed to destroy session: {0}")]
    Destroy(String),
}

/// Options for adding one transfer to the engine.
#[derive(Debug, Clone)]
pub struct AddOptions {
    /// Per-download storage directory (`{root}/{id}`).
    pub path: PathBuf,
    pub max_peer_connections: usize,
    pub announce: Vec<String>,
}

impl AddOptions {
    pub fn for_path(path: PathBuf) -> Self {
        Self {
            path,
            max_peer_connections: MAX_SESSION_PEER_CONNECTIONS,
            announce: TRACKERS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// One file inside a session's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    pub index: usize,
    pub name: String,
    pub length: u64,
}

/// Telemetry sampled from a live transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferTelemetry {
    /// Completed fraction, 0.0..=1.0.
    pub progress: f64,
    /// Estimated milliseconds remaining.
    pub time_remaining: i64,
    /// Download speed in bytes per second.
    pub speed: u64,
    pub num_peers: u32,
}

/// Lifecycle events emitted by a [TransferSession].
///
/// Events for a given session are delivered in emission order. After a
/// terminal event (`Done`, `Error`, `NoPeers`) no further events follow.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Content metadata resolved; [TransferSession::files] is now populated.
    MetadataResolved,
    Progress(TransferTelemetry),
    Done,
    Error(String),
    NoPeers,
}

/// Live handle for one in-progress transfer.
#[async_trait]
pub trait TransferSession: Send + Sync + 'static {
    /// Subscribe to the session's event stream.
    fn events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Files in the transfer; empty until metadata resolves.
    fn files(&self) -> Vec<TransferFile>;

    async fn select(&self, file_index: usize) -> Result<(), EngineError>;

    async fn deselect(&self, file_index: usize) -> Result<(), EngineError>;

    /// Stop the transfer and release its resources.
    async fn destroy(&self) -> Result<(), EngineError>;
}

/// Shared peer-to-peer engine. Created lazily, destroyed when the queue and
/// both session registries are empty, recreated after a fatal error.
#[async_trait]
pub trait TransferEngine: Send + Sync + 'static {
    async fn add(
        &self,
        uri: &str,
        options: AddOptions,
    ) -> Result<Arc<dyn TransferSession>, EngineError>;

    /// Engine-level (not per-session) errors; one firing means the whole
    /// engine is unusable and must be replaced.
    fn fatal_errors(&self) -> broadcast::Receiver<String>;

    /// Best-effort teardown of the engine and every session it still holds.
    async fn shutdown(&self);
}

/// Constructs engine instances so the queue can recreate the engine after a
/// fatal error and tests can inject scripted implementations.
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    async fn create(&self) -> Result<Arc<dyn TransferEngine>, EngineError>;
}

/// Session event channel whose first subscriber receives every event sent
/// since the channel was created. The emitting side may start before the
/// controller subscribes; a plain broadcast sender would drop those events.
pub(crate) struct SessionEventChannel {
    tx: broadcast::Sender<SessionEvent>,
    initial: Mutex<Option<broadcast::Receiver<SessionEvent>>>,
}

impl SessionEventChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = broadcast::channel(capacity);
        Self {
            tx,
            initial: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn send(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.initial
            .lock()
            .take()
            .unwrap_or_else(|| self.tx.subscribe())
    }
}
