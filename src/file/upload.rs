//! Upload manager.
//!
//! A bounded pool of worker threads drains the persistent pending queue in
//! the upload DB. Each upload runs under its own stop token so it can be
//! cancelled individually (`remove_upload`) or collectively (shutdown);
//! cancellation keeps the resume record so a later queue attempt retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::db::{FileMgrDb, ResumeEntry, UploadEntry};
use crate::error::ApiError;
use crate::events::{Event, EventBus, EventKind};
use crate::file::{OpenFile, UploadStore};
use crate::provider::Provider;
use crate::stop::{StopSource, StopToken};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Invoked when an upload reaches a terminal outcome, with the api path and
/// the result. The open-file table uses this to clear the modified flag.
pub type CompletionHandler = Box<dyn Fn(&str, ApiError) + Send + Sync>;

struct ActiveUpload {
    stop: StopSource,
    cancelled: bool,
}

#[derive(Default)]
struct ManagerState {
    active: HashMap<String, ActiveUpload>,
    attempts: HashMap<String, u16>,
    workers: Vec<JoinHandle<()>>,
}

pub struct UploadManager {
    db: Arc<FileMgrDb>,
    provider: Arc<dyn Provider>,
    events: Arc<EventBus>,
    retry_limit: u16,
    stop: StopSource,
    state: Mutex<ManagerState>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    completion: Mutex<Option<CompletionHandler>>,
}

impl UploadManager {
    pub fn new(
        db: Arc<FileMgrDb>,
        provider: Arc<dyn Provider>,
        events: Arc<EventBus>,
        retry_limit: u16,
    ) -> Arc<Self> {
        let (wake_tx, wake_rx) = unbounded();
        Arc::new(Self {
            db,
            provider,
            events,
            retry_limit: retry_limit.max(1),
            stop: StopSource::new(),
            state: Mutex::new(ManagerState::default()),
            wake_tx,
            wake_rx,
            completion: Mutex::new(None),
        })
    }

    /// Register the terminal-outcome callback. At most one handler exists.
    pub fn set_completion_handler(&self, handler: CompletionHandler) {
        *self.completion.lock() = Some(handler);
    }

    /// Requeue uploads interrupted by the previous shutdown, then start
    /// `worker_count` workers.
    pub fn start(self: &Arc<Self>, worker_count: u8) {
        match self.db.requeue_active_uploads() {
            Ok(restored) => {
                for entry in &restored {
                    debug!("requeued interrupted upload of {}", entry.api_path);
                }
            }
            Err(err) => warn!("failed to requeue interrupted uploads: {err}"),
        }

        let mut state = self.state.lock();
        for idx in 0..worker_count.max(1) {
            let this = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("upload-worker-{idx}"))
                .spawn(move || this.worker_loop())
                .expect("failed to spawn upload worker");
            state.workers.push(handle);
        }
    }

    /// Stop the pool: cancel every active upload and join the workers.
    pub fn stop(&self) {
        self.stop.stop();
        {
            let state = self.state.lock();
            for active in state.active.values() {
                active.stop.stop();
            }
        }
        let _ = self.wake_tx.send(());

        let workers = std::mem::take(&mut self.state.lock().workers);
        for handle in workers {
            let _ = handle.join();
        }
    }

    /// Whether `api_path` has work in any stage of the upload pipeline.
    pub fn is_processing(&self, api_path: &str) -> bool {
        if self.state.lock().active.contains_key(api_path) {
            return true;
        }
        matches!(self.db.get_upload(api_path), Ok(Some(_)))
            || matches!(self.db.get_resume(api_path), Ok(Some(_)))
    }

    /// Persisted resume records, used by the table on startup.
    pub fn get_resume_list(&self) -> Vec<ResumeEntry> {
        self.db.get_resume_list().unwrap_or_default()
    }

    pub fn rename_resume(&self, from_api_path: &str, to_api_path: &str) {
        if let Err(err) = self.db.rename_resume(from_api_path, to_api_path) {
            warn!("failed to rename resume {from_api_path} -> {to_api_path}: {err}");
        }
    }

    pub fn remove_resume_record(&self, api_path: &str) {
        if let Err(err) = self.db.remove_resume(api_path) {
            warn!("failed to remove resume for {api_path}: {err}");
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            if self.stop.is_stopped() {
                return;
            }
            match self.db.activate_next_upload() {
                Ok(Some(entry)) => self.process(entry),
                Ok(None) => {
                    let _ = self.wake_rx.recv_timeout(IDLE_POLL);
                }
                Err(err) => {
                    warn!("upload queue read failed: {err}");
                    let _ = self.wake_rx.recv_timeout(IDLE_POLL);
                }
            }
        }
    }

    fn process(&self, entry: UploadEntry) {
        let token = {
            let mut state = self.state.lock();
            let active = ActiveUpload {
                stop: StopSource::new(),
                cancelled: false,
            };
            let token = active.stop.token();
            state.active.insert(entry.api_path.clone(), active);
            token
        };

        self.events.emit(
            Event::new(EventKind::FileUploadStarted)
                .with("api_path", entry.api_path.clone())
                .with("source", entry.source_path.clone()),
        );

        let result = self.run_upload(&entry, &token);

        let cancelled = self
            .state
            .lock()
            .active
            .remove(&entry.api_path)
            .map(|active| active.cancelled)
            .unwrap_or(false);

        match result {
            Ok(()) => self.finish_success(&entry),
            Err(ApiError::UploadStopped) => self.finish_stopped(&entry, cancelled),
            Err(err) if token.is_stopped() => {
                debug!("upload of {} interrupted by {err}", entry.api_path);
                self.finish_stopped(&entry, cancelled);
            }
            Err(err) if is_retryable(err) => self.finish_retry(&entry, err),
            Err(err) => self.finish_failed(&entry, err),
        }
    }

    fn run_upload(&self, entry: &UploadEntry, token: &StopToken) -> Result<(), ApiError> {
        if token.is_stopped() {
            return Err(ApiError::UploadStopped);
        }
        self.provider
            .upload_file(&entry.api_path, &entry.source_path, token)
    }

    fn finish_success(&self, entry: &UploadEntry) {
        // Clearing the resume record before announcing completion orders a
        // completed upload before the next provider read of the same path.
        if let Err(err) = self.db.remove_resume(&entry.api_path) {
            warn!("failed to clear resume after upload of {}: {err}", entry.api_path);
        }
        if let Err(err) = self.db.remove_upload_active(&entry.api_path) {
            warn!("failed to clear active upload of {}: {err}", entry.api_path);
        }
        self.state.lock().attempts.remove(&entry.api_path);

        self.events.emit(
            Event::new(EventKind::FileUploadCompleted)
                .with("api_path", entry.api_path.clone())
                .with("source", entry.source_path.clone())
                .with("result", ApiError::Success.to_string())
                .with("cancelled", "0"),
        );
        self.notify_completion(&entry.api_path, ApiError::Success);
    }

    fn finish_stopped(&self, entry: &UploadEntry, cancelled: bool) {
        // Resume stays so a later queue_upload can retry.
        if let Err(err) = self.db.remove_upload_active(&entry.api_path) {
            warn!("failed to clear active upload of {}: {err}", entry.api_path);
        }
        self.events.emit(
            Event::new(EventKind::FileUploadCompleted)
                .with("api_path", entry.api_path.clone())
                .with("source", entry.source_path.clone())
                .with("result", ApiError::UploadStopped.to_string())
                .with("cancelled", if cancelled { "1" } else { "0" }),
        );
        self.notify_completion(&entry.api_path, ApiError::UploadStopped);
    }

    fn finish_retry(&self, entry: &UploadEntry, err: ApiError) {
        let attempt = {
            let mut state = self.state.lock();
            let attempt = state.attempts.entry(entry.api_path.clone()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        if attempt >= self.retry_limit {
            self.state.lock().attempts.remove(&entry.api_path);
            self.finish_failed(entry, err);
            return;
        }

        let backoff = BACKOFF_BASE
            .saturating_mul(1 << (attempt - 1).min(8))
            .min(BACKOFF_CAP);
        self.events.emit(
            Event::new(EventKind::FileUploadRetry)
                .with("api_path", entry.api_path.clone())
                .with("source", entry.source_path.clone())
                .with("result", err.to_string()),
        );
        debug!(
            "retrying upload of {} in {backoff:?} (attempt {attempt}/{})",
            entry.api_path, self.retry_limit
        );
        self.stop.token().wait_for(backoff);

        if let Err(err) = self.db.remove_upload_active(&entry.api_path) {
            warn!("failed to clear active upload of {}: {err}", entry.api_path);
        }
        if self.stop.is_stopped() {
            return;
        }
        if let Err(err) = self.db.add_upload(&entry.api_path, &entry.source_path) {
            warn!("failed to requeue upload of {}: {err}", entry.api_path);
        }
        let _ = self.wake_tx.send(());
    }

    fn finish_failed(&self, entry: &UploadEntry, err: ApiError) {
        if let Err(db_err) = self.db.remove_upload_active(&entry.api_path) {
            warn!("failed to clear active upload of {}: {db_err}", entry.api_path);
        }
        self.events.emit(
            Event::new(EventKind::FileUploadFailed)
                .with("api_path", entry.api_path.clone())
                .with("source", entry.source_path.clone())
                .with("result", err.to_string()),
        );
        self.notify_completion(&entry.api_path, err);
    }

    fn notify_completion(&self, api_path: &str, result: ApiError) {
        if let Some(handler) = self.completion.lock().as_ref() {
            handler(api_path, result);
        }
    }
}

impl UploadStore for UploadManager {
    fn queue_upload(&self, file: &dyn OpenFile) {
        let api_path = file.get_api_path();
        let source_path = file.get_source_path();
        if let Err(err) = self.db.add_upload(&api_path, &source_path) {
            warn!("failed to queue upload of {api_path}: {err}");
            return;
        }
        self.events.emit(
            Event::new(EventKind::FileUploadQueued)
                .with("api_path", api_path)
                .with("source", source_path),
        );
        let _ = self.wake_tx.send(());
    }

    fn remove_upload(&self, api_path: &str) {
        {
            let mut state = self.state.lock();
            if let Some(active) = state.active.get_mut(api_path) {
                active.cancelled = true;
                active.stop.stop();
            }
            state.attempts.remove(api_path);
        }
        if let Err(err) = self.db.remove_upload(api_path) {
            warn!("failed to remove upload of {api_path}: {err}");
            return;
        }
        self.events.emit(
            Event::new(EventKind::FileUploadRemoved).with("api_path", api_path.to_owned()),
        );
    }

    fn store_resume(&self, file: &dyn OpenFile) {
        let entry = ResumeEntry {
            api_path: file.get_api_path(),
            chunk_size: file.get_chunk_size(),
            read_state: file.get_read_state().to_hex(),
            source_path: file.get_source_path(),
        };
        if let Err(err) = self.db.add_resume(&entry) {
            warn!("failed to store resume for {}: {err}", entry.api_path);
        }
    }

    fn remove_resume(&self, api_path: &str, _source_path: &str) {
        self.remove_resume_record(api_path);
    }
}

fn is_retryable(err: ApiError) -> bool {
    matches!(
        err,
        ApiError::CommError | ApiError::OsError | ApiError::UploadFailed
    )
}
