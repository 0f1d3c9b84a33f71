//! Download queue manager.
//!
//! Owns the queue of pending/active records, the connecting/active session
//! registries and the shared transfer-engine handle. Dispatches queued
//! records through the session controller with a bounded concurrency, seeds
//! the queue from the store after a restart, and recreates the engine after
//! a fatal engine error.
//!
//! All shared state sits behind one mutex that is only ever locked between
//! await points, so no two event continuations interleave mid-update.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine::{EngineFactory, TransferEngine, TransferFile, TransferSession};
use crate::models::{DownloadRecord, DownloadStatus, ItemType};
use crate::services::downloads::session::Settle;
use crate::services::subtitles::SubtitleSearch;
use crate::store::{DownloadUpdate, ItemDownloadUpdate, MediaStore};

/// Session admitted to the engine, metadata not yet resolved.
pub(crate) struct ConnectingEntry {
    pub(crate) session: Arc<dyn TransferSession>,
    pub(crate) settle: Arc<Settle>,
}

/// Session with its media file selected and transferring.
pub(crate) struct ActiveEntry {
    pub(crate) session: Arc<dyn TransferSession>,
    #[allow(dead_code)]
    pub(crate) file: TransferFile,
    pub(crate) settle: Arc<Settle>,
}

pub(crate) struct QueueState {
    pub(crate) queue: Vec<DownloadRecord>,
    pub(crate) connecting: HashMap<String, ConnectingEntry>,
    pub(crate) active: HashMap<String, ActiveEntry>,
    pub(crate) engine: Option<Arc<dyn TransferEngine>>,
    /// Identifier of the dispatch pass currently draining the queue, if any.
    /// A pass only keeps going while it still owns this slot, which lets the
    /// engine-crash path revoke a stale pass and start a fresh one.
    pub(crate) dispatching: Option<u64>,
    pub(crate) pass_counter: u64,
}

/// Background download queue and transfer-session orchestrator.
pub struct DownloadService {
    self_ref: Weak<Self>,
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn MediaStore>,
    engines: Arc<dyn EngineFactory>,
    pub(crate) subtitles: Arc<dyn SubtitleSearch>,
    pub(crate) state: Mutex<QueueState>,
}

impl DownloadService {
    pub fn new(
        config: Config,
        store: Arc<dyn MediaStore>,
        engines: Arc<dyn EngineFactory>,
        subtitles: Arc<dyn SubtitleSearch>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            store,
            engines,
            subtitles,
            state: Mutex::new(QueueState {
                queue: Vec::new(),
                connecting: HashMap::new(),
                active: HashMap::new(),
                engine: None,
                dispatching: None,
                pass_counter: 0,
            }),
        })
    }

    /// Strong reference for spawning background work from `&self` methods.
    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    /// Seed the queue with every record that was still incomplete when the
    /// process last stopped, and start dispatching them.
    pub async fn start(&self) -> anyhow::Result<()> {
        let incomplete = self
            .store
            .downloads_with_status(DownloadStatus::INCOMPLETE)
            .await?;

        info!(count = incomplete.len(), "Found incomplete downloads");

        self.state.lock().queue = incomplete;
        if let Some(service) = self.arc() {
            tokio::spawn(async move { service.run_queued().await });
        }
        Ok(())
    }

    /// Append a record to the queue. If the queue was empty and no dispatch
    /// pass is running, a pass is started in the background.
    pub fn enqueue(&self, record: DownloadRecord) {
        let dispatch = {
            let mut state = self.state.lock();
            state.queue.push(record.clone());
            info!(
                download_id = %record.id,
                queue_size = state.queue.len(),
                "Added to queue"
            );
            state.queue.len() == 1 && state.dispatching.is_none()
        };

        if dispatch {
            if let Some(service) = self.arc() {
                tokio::spawn(async move { service.run_queued().await });
            }
        }
    }

    /// Drain the queue through the session controller, at most
    /// `max_concurrent_downloads` records at a time. Records enqueued while
    /// a pass is running are picked up by the same pass; each queue entry is
    /// dispatched at most once per pass. A no-op while another pass runs,
    /// and with an empty queue it only runs the engine teardown check.
    pub async fn run_queued(&self) {
        let pass_id = {
            let mut state = self.state.lock();
            if state.dispatching.is_some() || state.queue.is_empty() {
                None
            } else {
                state.pass_counter += 1;
                state.dispatching = Some(state.pass_counter);
                Some(state.pass_counter)
            }
        };

        let Some(pass_id) = pass_id else {
            self.teardown_if_idle();
            return;
        };

        let Some(service) = self.arc() else { return };
        let mut dispatched: HashSet<String> = HashSet::new();

        loop {
            let batch: Vec<DownloadRecord> = {
                let mut state = self.state.lock();
                if state.dispatching != Some(pass_id) {
                    // Revoked: a replacement pass owns the queue now.
                    break;
                }

                let batch: Vec<DownloadRecord> = state
                    .queue
                    .iter()
                    .filter(|record| !dispatched.contains(&record.id))
                    .cloned()
                    .collect();
                if batch.is_empty() {
                    state.dispatching = None;
                    break;
                }
                batch
            };

            info!(queue_size = batch.len(), "Start queued downloads");
            dispatched.extend(batch.iter().map(|record| record.id.clone()));

            futures::stream::iter(batch)
                .for_each_concurrent(self.config.max_concurrent_downloads, |record| {
                    let service = service.clone();
                    async move {
                        // Re-check ownership per record: a revoked pass must
                        // not keep admitting work next to its replacement.
                        if service.state.lock().dispatching != Some(pass_id) {
                            return;
                        }
                        service.run_one(record).await
                    }
                })
                .await;
        }

        self.teardown_if_idle();
    }

    /// Stop a connecting or active download and resolve its pending
    /// controller invocation. Idempotent: stopping a record with no session
    /// is a no-op.
    pub async fn stop_download(&self, record: &DownloadRecord) {
        let (connecting, active) = {
            let state = self.state.lock();
            (
                state
                    .connecting
                    .get(&record.id)
                    .map(|entry| (entry.session.clone(), entry.settle.clone())),
                state
                    .active
                    .get(&record.id)
                    .map(|entry| (entry.session.clone(), entry.settle.clone())),
            )
        };

        if let (Some((session, settle)), None) = (&connecting, &active) {
            info!(download_id = %record.id, "Stop connecting");

            if let Err(e) = session.destroy().await {
                error!(download_id = %record.id, error = %e, "Error destroying connecting session");
            }

            self.remove_from_registries(&record.id);
            settle.settle();
            self.teardown_if_idle();
            return;
        }

        let Some((session, settle)) = active else {
            return;
        };

        info!(download_id = %record.id, "Stop downloading");

        if let Err(e) = session.destroy().await {
            error!(download_id = %record.id, error = %e, "Error destroying downloading session");
        }

        info!(download_id = %record.id, "Stopped download");

        self.remove_from_registries(&record.id);
        settle.settle();
        self.teardown_if_idle();
    }

    /// Remove a download's traces: optionally its persisted record, its queue
    /// membership, and its storage directory. Every step is best-effort.
    pub async fn clean_up_download(&self, record: &DownloadRecord, delete_record: bool) {
        if delete_record {
            if let Err(e) = self.store.delete_download(&record.id).await {
                error!(download_id = %record.id, error = %e, "Failed to delete download record");
            }
        }

        let removed = {
            let mut state = self.state.lock();
            let before = state.queue.len();
            state.queue.retain(|queued| queued.id != record.id);
            (before != state.queue.len()).then_some(state.queue.len())
        };
        if let Some(queue_size) = removed {
            info!(download_id = %record.id, queue_size, "Removed from queue");
        }

        let location = self.download_location(&record.id);
        if let Err(e) = tokio::fs::remove_dir_all(&location).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(
                    download_id = %record.id,
                    path = %location.display(),
                    error = %e,
                    "Error cleaning up download directory"
                );
            }
        }

        self.teardown_if_idle();
    }

    /// Current queue length.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Sessions admitted but without resolved metadata.
    pub fn connecting_count(&self) -> usize {
        self.state.lock().connecting.len()
    }

    /// Sessions transferring their selected file.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Whether the shared transfer engine currently exists.
    pub fn has_engine(&self) -> bool {
        self.state.lock().engine.is_some()
    }

    pub(crate) fn download_location(&self, id: &str) -> PathBuf {
        self.config.download_root.join(id)
    }

    fn remove_from_registries(&self, id: &str) {
        let mut state = self.state.lock();
        state.connecting.remove(id);
        state.active.remove(id);
    }

    /// Return the shared engine, creating it (and installing the fatal-error
    /// watcher) if none exists. Safe under concurrent callers: the loser of
    /// a creation race shuts its instance down and uses the winner's.
    pub(crate) async fn ensure_engine(&self) -> anyhow::Result<Arc<dyn TransferEngine>> {
        if let Some(engine) = self.state.lock().engine.clone() {
            return Ok(engine);
        }

        info!("Creating new transfer engine");
        let created = self.engines.create().await?;

        let (engine, extra) = {
            let mut state = self.state.lock();
            match &state.engine {
                Some(existing) => (existing.clone(), Some(created)),
                None => {
                    state.engine = Some(created.clone());
                    (created, None)
                }
            }
        };

        if let Some(extra) = extra {
            tokio::spawn(async move { extra.shutdown().await });
            return Ok(engine);
        }

        if let Some(service) = self.arc() {
            let failed = engine.clone();
            let mut errors = engine.fatal_errors();
            tokio::spawn(async move {
                if let Ok(message) = errors.recv().await {
                    service.handle_engine_fatal_boxed(failed, message).await;
                }
            });
        }

        Ok(engine)
    }

    /// Boxed indirection for the watcher task: its future would otherwise
    /// recursively contain `ensure_engine`, which spawns the watcher.
    fn handle_engine_fatal_boxed(
        self: Arc<Self>,
        failed: Arc<dyn TransferEngine>,
        message: String,
    ) -> BoxFuture<'static, ()> {
        async move { self.handle_engine_fatal(failed, message).await }.boxed()
    }

    /// Destroy the engine iff no queued record and no session remains. A pure
    /// check of current collection sizes, callable redundantly from every
    /// completion path.
    pub(crate) fn teardown_if_idle(&self) {
        let engine = {
            let mut state = self.state.lock();
            if state.engine.is_some()
                && state.queue.is_empty()
                && state.connecting.is_empty()
                && state.active.is_empty()
            {
                state.engine.take()
            } else {
                None
            }
        };

        if let Some(engine) = engine {
            info!("No downloads left, transfer engine shut down");
            tokio::spawn(async move { engine.shutdown().await });
        }
    }

    /// The whole engine is unusable: drop it, settle every in-flight session
    /// (their handles are invalid now), and re-dispatch the full queue
    /// against a fresh instance.
    async fn handle_engine_fatal(&self, failed: Arc<dyn TransferEngine>, message: String) {
        let stale = {
            let mut state = self.state.lock();
            let current = state
                .engine
                .as_ref()
                .map(|engine| Arc::ptr_eq(engine, &failed))
                .unwrap_or(false);
            if !current {
                return;
            }

            state.engine = None;
            state.dispatching = None;

            let mut stale: Vec<Arc<Settle>> =
                state.connecting.drain().map(|(_, entry)| entry.settle).collect();
            stale.extend(state.active.drain().map(|(_, entry)| entry.settle));
            stale
        };

        error!(error = %message, "Transfer engine crashed, recreating");

        for settle in stale {
            settle.settle();
        }

        if let Err(e) = self.ensure_engine().await {
            error!(error = %e, "Failed to recreate transfer engine");
            return;
        }

        self.run_queued().await;
    }

    /// Apply a partial update through the store, logging failures and
    /// carrying on with the in-memory record (no retry).
    pub(crate) async fn persist_download(
        &self,
        record: &DownloadRecord,
        update: DownloadUpdate,
    ) -> DownloadRecord {
        match self.store.update_download(&record.id, update.clone()).await {
            Ok(updated) => updated,
            Err(e) => {
                error!(download_id = %record.id, error = %e, "Failed to persist download update");
                let mut fallback = record.clone();
                update.apply(&mut fallback);
                fallback
            }
        }
    }

    /// Merge an update into the item's download sub-document, logging
    /// failures.
    pub(crate) async fn persist_item(
        &self,
        item_type: ItemType,
        id: &str,
        update: ItemDownloadUpdate,
    ) {
        debug!(item_id = %id, update = ?update, "Update item download info");

        if let Err(e) = self.store.update_item(item_type, id, update).await {
            error!(item_id = %id, error = %e, "Failed to persist item download update");
        }
    }

    /// Mark the record and its media item failed.
    pub(crate) async fn mark_failed(&self, record: &DownloadRecord) {
        self.persist_download(record, DownloadUpdate::status(DownloadStatus::Failed))
            .await;
        self.persist_item(record.item_type, &record.id, ItemDownloadUpdate::failed())
            .await;
    }
}
