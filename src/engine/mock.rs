//! Scripted [TransferEngine] used by the queue tests.
//!
//! Tests drive sessions by emitting [SessionEvent]s directly and assert on
//! what the queue asked the engine to do (adds, selections, destroys,
//! shutdowns).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::engine::{
    AddOptions, EngineError, EngineFactory, SessionEvent, TransferEngine, TransferFile,
    TransferSession,
};

/// Shared handle the tests keep to inspect and drive every engine the
/// factory handed out.
#[derive(Default)]
pub struct MockControl {
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockControl {
    pub fn engines_created(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn engine(&self, index: usize) -> Arc<MockEngine> {
        self.engines.lock()[index].clone()
    }

    pub fn last_engine(&self) -> Arc<MockEngine> {
        self.engines.lock().last().expect("no engine created").clone()
    }

    /// Total sessions added across all engines, in add order.
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.engines
            .lock()
            .iter()
            .flat_map(|e| e.sessions.lock().clone())
            .collect()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions()[index].clone()
    }
}

pub struct MockEngineFactory {
    pub control: Arc<MockControl>,
    /// Files every new session reports once metadata resolves.
    pub default_files: Vec<TransferFile>,
}

impl MockEngineFactory {
    pub fn new() -> (Self, Arc<MockControl>) {
        let control = Arc::new(MockControl::default());
        let factory = Self {
            control: control.clone(),
            default_files: vec![TransferFile {
                index: 0,
                name: "movie.1080p.mkv".to_string(),
                length: 700_000_000,
            }],
        };
        (factory, control)
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self) -> Result<Arc<dyn TransferEngine>, EngineError> {
        let engine = Arc::new(MockEngine {
            adds: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            default_files: self.default_files.clone(),
            fatal_tx: broadcast::channel(8).0,
            shutdowns: AtomicUsize::new(0),
        });
        self.control.engines.lock().push(engine.clone());
        Ok(engine)
    }
}

pub struct MockEngine {
    adds: Mutex<Vec<(String, AddOptions)>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    default_files: Vec<TransferFile>,
    fatal_tx: broadcast::Sender<String>,
    shutdowns: AtomicUsize,
}

impl MockEngine {
    pub fn add_count(&self) -> usize {
        self.adds.lock().len()
    }

    pub fn adds(&self) -> Vec<(String, AddOptions)> {
        self.adds.lock().clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Fire the engine-level error event.
    pub fn trigger_fatal(&self, message: &str) {
        let _ = self.fatal_tx.send(message.to_string());
    }
}

#[async_trait]
impl TransferEngine for MockEngine {
    async fn add(
        &self,
        uri: &str,
        options: AddOptions,
    ) -> Result<Arc<dyn TransferSession>, EngineError> {
        self.adds.lock().push((uri.to_string(), options));

        let session = Arc::new(MockSession {
            files: Mutex::new(self.default_files.clone()),
            event_tx: broadcast::channel(64).0,
            selected: Mutex::new(Vec::new()),
            deselected: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }

    fn fatal_errors(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockSession {
    files: Mutex<Vec<TransferFile>>,
    event_tx: broadcast::Sender<SessionEvent>,
    selected: Mutex<Vec<usize>>,
    deselected: Mutex<Vec<usize>>,
    destroyed: AtomicBool,
}

impl MockSession {
    pub fn set_files(&self, files: Vec<TransferFile>) {
        *self.files.lock() = files;
    }

    /// Emit an event, waiting until the session controller has subscribed so
    /// nothing is lost to an empty broadcast channel.
    pub async fn emit(&self, event: SessionEvent) {
        while self.event_tx.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        let _ = self.event_tx.send(event);
    }

    pub fn selected(&self) -> Vec<usize> {
        self.selected.lock().clone()
    }

    pub fn deselected(&self) -> Vec<usize> {
        self.deselected.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferSession for MockSession {
    fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn files(&self) -> Vec<TransferFile> {
        self.files.lock().clone()
    }

    async fn select(&self, file_index: usize) -> Result<(), EngineError> {
        self.selected.lock().push(file_index);
        Ok(())
    }

    async fn deselect(&self, file_index: usize) -> Result<(), EngineError> {
        self.deselected.lock().push(file_index);
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
