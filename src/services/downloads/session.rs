//! Per-download session controller.
//!
//! One invocation per dispatched record: re-validate admission, pick the
//! candidate source, start the transfer session and translate its events
//! into state transitions and persistence writes. An invocation resolves
//! exactly once and never fails, so a bad record cannot abort the bounded
//! dispatch batch it runs in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{AddOptions, SessionEvent, TransferFile, TransferSession};
use crate::models::{format_speed, DownloadRecord, DownloadStatus};
use crate::services::downloads::service::{ActiveEntry, ConnectingEntry, DownloadService};
use crate::store::{DownloadUpdate, ItemDownloadUpdate};

/// Name fragments accepted as playable media.
const SUPPORTED_FORMATS: &[&str] = &["mp4", "ogg", "mov", "webmv", "mkv", "wmv", "avi"];

/// Minimum wall-clock time between two telemetry persistence writes.
const PROGRESS_WRITE_INTERVAL: Duration = Duration::from_millis(1000);

/// Progress percentage past which the selected file exists on disk and a
/// subtitle search can be started.
const SUBTITLE_SEARCH_THRESHOLD: f64 = 0.08;

/// Delay before the terminal "complete" write, so a telemetry write that was
/// already in flight when the transfer finished cannot land after it.
const COMPLETE_WRITE_DELAY: Duration = Duration::from_millis(500);

/// Single-shot completion handle for one session controller invocation.
///
/// Every terminal path (done, error, no peers, cancellation, engine crash)
/// settles it; only the first call resolves the awaiting dispatcher slot.
pub(crate) struct Settle {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    done: CancellationToken,
}

impl Settle {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                done: CancellationToken::new(),
            }),
            rx,
        )
    }

    pub(crate) fn settle(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
        self.done.cancel();
    }

    fn settled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.done.cancelled()
    }
}

/// Among the session's files, the largest one whose name contains a
/// supported format fragment. Falls back to the first file when nothing
/// matches.
pub(crate) fn pick_media_file(files: &[TransferFile]) -> Option<TransferFile> {
    let best = files
        .iter()
        .filter(|file| {
            SUPPORTED_FORMATS
                .iter()
                .any(|format| file.name.contains(format))
        })
        .max_by_key(|file| file.length);

    best.or_else(|| files.first()).cloned()
}

impl DownloadService {
    /// Download one record. Resolves exactly once; all failure paths are
    /// handled internally so the dispatch batch keeps running.
    pub(crate) async fn run_one(self: Arc<Self>, record: DownloadRecord) {
        info!(download_id = %record.id, "Start download");

        // The record may have been cancelled while waiting for a dispatch
        // slot, or an earlier pass may still hold a session for it.
        {
            let state = self.state.lock();
            if !state.queue.iter().any(|queued| queued.id == record.id) {
                info!(download_id = %record.id, "Download was removed, skipping");
                return;
            }
            if state.connecting.contains_key(&record.id) || state.active.contains_key(&record.id) {
                info!(download_id = %record.id, "Download is already going");
                return;
            }
        }

        let item = match self.store.find_item(record.item_type, &record.id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(download_id = %record.id, "No media item found for download");
                self.mark_failed(&record).await;
                return;
            }
            Err(e) => {
                error!(download_id = %record.id, error = %e, "Failed to load media item");
                self.mark_failed(&record).await;
                return;
            }
        };

        let Some(candidate) = item.candidate_for(&record) else {
            warn!(
                download_id = %record.id,
                quality = %record.quality,
                "No candidate source for requested quality"
            );
            self.mark_failed(&record).await;
            return;
        };
        let uri = candidate.url.clone();

        self.persist_item(record.item_type, &record.id, ItemDownloadUpdate::connecting())
            .await;
        let record = self
            .persist_download(&record, DownloadUpdate::status_cleared(DownloadStatus::Connecting))
            .await;

        let engine = match self.ensure_engine().await {
            Ok(engine) => engine,
            Err(e) => {
                error!(download_id = %record.id, error = %e, "Failed to set up transfer engine");
                self.mark_failed(&record).await;
                return;
            }
        };

        let options = AddOptions::for_path(self.download_location(&record.id));
        let session = match engine.add(&uri, options).await {
            Ok(session) => session,
            Err(e) => {
                error!(download_id = %record.id, error = %e, "Failed to add transfer");
                self.mark_failed(&record).await;
                self.clean_up_download(&record, false).await;
                return;
            }
        };

        // Registered before any session event can be observed, so the same
        // identifier cannot be admitted twice during the connecting window.
        // The registration re-checks both registries: two invocations for the
        // same id can race past the admission check above, and the loser must
        // not orphan the winner's entry.
        let (settle, resolved) = Settle::new();
        let duplicate = {
            let mut state = self.state.lock();
            if state.connecting.contains_key(&record.id) || state.active.contains_key(&record.id) {
                true
            } else {
                state.connecting.insert(
                    record.id.clone(),
                    ConnectingEntry {
                        session: session.clone(),
                        settle: settle.clone(),
                    },
                );
                false
            }
        };
        if duplicate {
            warn!(download_id = %record.id, "Download is already going");
            if let Err(e) = session.destroy().await {
                error!(download_id = %record.id, error = %e, "Error destroying duplicate session");
            }
            return;
        }

        tokio::spawn(
            self.clone()
                .drive_session(record.clone(), session, settle),
        );

        let _ = resolved.await;
    }

    /// Event loop for one live session. Runs until a terminal event, a
    /// cancellation, or the engine drops the session.
    async fn drive_session(
        self: Arc<Self>,
        record: DownloadRecord,
        session: Arc<dyn TransferSession>,
        settle: Arc<Settle>,
    ) {
        let mut events = session.events();

        let mut selected_file: Option<TransferFile> = None;
        let mut searched_subtitles = false;
        let mut item_marked_downloading = false;
        let mut last_write: Option<Instant> = None;
        let writing = Arc::new(AtomicBool::new(false));

        loop {
            let event = tokio::select! {
                _ = settle.settled() => break,
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(download_id = %record.id, missed, "Session events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match event {
                SessionEvent::MetadataResolved => {
                    let files = session.files();
                    let Some(file) = pick_media_file(&files) else {
                        warn!(download_id = %record.id, "Session resolved with no files");
                        continue;
                    };

                    for other in &files {
                        if other.index != file.index {
                            if let Err(e) = session.deselect(other.index).await {
                                error!(download_id = %record.id, error = %e, "Failed to deselect file");
                            }
                        }
                    }
                    if let Err(e) = session.select(file.index).await {
                        error!(download_id = %record.id, error = %e, "Failed to select file");
                    }

                    debug!(download_id = %record.id, file = %file.name, "Selected media file");
                    selected_file = Some(file.clone());

                    // Promote connecting -> active, keeping the same settle
                    // handle.
                    let mut state = self.state.lock();
                    state.connecting.remove(&record.id);
                    state.active.insert(
                        record.id.clone(),
                        ActiveEntry {
                            session: session.clone(),
                            file,
                            settle: settle.clone(),
                        },
                    );
                }

                SessionEvent::Progress(telemetry) => {
                    let progress = (telemetry.progress * 10_000.0).round() / 100.0;

                    if !searched_subtitles && progress > SUBTITLE_SEARCH_THRESHOLD {
                        if let Some(file) = &selected_file {
                            searched_subtitles = true;
                            self.subtitles.search_for_subtitles(&record, file);
                        }
                    }

                    let now = Instant::now();
                    let due = last_write
                        .map(|at| now.duration_since(at) >= PROGRESS_WRITE_INTERVAL)
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    last_write = Some(now);

                    debug!(
                        download_id = %record.id,
                        progress = format!("{:.2}%", progress),
                        speed = %format_speed(telemetry.speed),
                        num_peers = telemetry.num_peers,
                        "Download progress"
                    );

                    // A telemetry write still in flight means this sample is
                    // dropped, not queued; the next tick carries fresh data.
                    if writing
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let service = self.clone();
                        let record = record.clone();
                        let writing = writing.clone();
                        tokio::spawn(async move {
                            service
                                .persist_download(
                                    &record,
                                    DownloadUpdate::telemetry(
                                        progress,
                                        telemetry.time_remaining,
                                        telemetry.speed,
                                        telemetry.num_peers,
                                    ),
                                )
                                .await;
                            writing.store(false, Ordering::SeqCst);
                        });
                    }

                    if !item_marked_downloading {
                        item_marked_downloading = true;
                        self.persist_item(
                            record.item_type,
                            &record.id,
                            ItemDownloadUpdate::downloading(),
                        )
                        .await;
                    }
                }

                SessionEvent::Done => {
                    info!(download_id = %record.id, "Download complete");

                    if let Err(e) = session.destroy().await {
                        error!(download_id = %record.id, error = %e, "Error destroying finished session");
                    }

                    {
                        let mut state = self.state.lock();
                        state.connecting.remove(&record.id);
                        state.active.remove(&record.id);
                        state.queue.retain(|queued| queued.id != record.id);
                    }
                    self.teardown_if_idle();

                    // Deferred so a telemetry write racing the final event
                    // cannot overwrite the terminal state.
                    let service = self.clone();
                    let record = record.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(COMPLETE_WRITE_DELAY).await;
                        service
                            .persist_download(&record, DownloadUpdate::complete())
                            .await;
                        service
                            .persist_item(
                                record.item_type,
                                &record.id,
                                ItemDownloadUpdate::complete(chrono::Utc::now()),
                            )
                            .await;
                    });

                    settle.settle();
                    break;
                }

                SessionEvent::Error(message) => {
                    error!(download_id = %record.id, error = %message, "Transfer session error");

                    self.mark_failed(&record).await;
                    {
                        let mut state = self.state.lock();
                        state.connecting.remove(&record.id);
                        state.active.remove(&record.id);
                    }
                    self.clean_up_download(&record, false).await;

                    settle.settle();
                    break;
                }

                SessionEvent::NoPeers => {
                    warn!(download_id = %record.id, "No peers found for download");

                    self.mark_failed(&record).await;
                    {
                        let mut state = self.state.lock();
                        state.connecting.remove(&record.id);
                        state.active.remove(&record.id);
                    }
                    self.clean_up_download(&record, false).await;

                    if let Err(e) = session.destroy().await {
                        error!(download_id = %record.id, error = %e, "Error destroying peerless session");
                    }

                    settle.settle();
                    break;
                }
            }
        }

        self.teardown_if_idle();
    }
}
