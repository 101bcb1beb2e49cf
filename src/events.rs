//! Process-wide event bus.
//!
//! Every interesting state change in the core is announced as an [`Event`]:
//! a tagged kind plus a flat list of string fields. Subscribers receive
//! events over a channel and filter by level; a built-in forwarder turns
//! every event into a `log` line so a bare subscriber set still leaves a
//! trail. The bus has an explicit lifecycle (`start`/`stop`) instead of
//! relying on static construction order.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, log_enabled, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity carried by every event; doubles as the config log filter.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Critical,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl EventLevel {
    pub fn from_config_value(value: &str) -> Self {
        match value {
            "critical" => Self::Critical,
            "error" => Self::Error,
            "warn" => Self::Warn,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => Self::Info,
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Every event the core can raise.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    DownloadRestored,
    DownloadRestoreFailed,
    DownloadStored,
    DriveMounted,
    DriveUnmounted,
    EventLevelChanged,
    FileUploadCompleted,
    FileUploadFailed,
    FileUploadNotFound,
    FileUploadQueued,
    FileUploadRemoved,
    FileUploadRetry,
    FileUploadStarted,
    FilesystemItemClosed,
    FilesystemItemEvicted,
    FilesystemItemHandleClosed,
    FilesystemItemHandleOpened,
    FilesystemItemOpened,
    ItemTimeout,
    OrphanedFileDeleted,
    OrphanedFileDetected,
}

impl EventKind {
    /// Stable snake_case name, used in logs and by name-based subscriptions.
    pub fn name(self) -> &'static str {
        match self {
            Self::DownloadRestored => "download_restored",
            Self::DownloadRestoreFailed => "download_restore_failed",
            Self::DownloadStored => "download_stored",
            Self::DriveMounted => "drive_mounted",
            Self::DriveUnmounted => "drive_unmounted",
            Self::EventLevelChanged => "event_level_changed",
            Self::FileUploadCompleted => "file_upload_completed",
            Self::FileUploadFailed => "file_upload_failed",
            Self::FileUploadNotFound => "file_upload_not_found",
            Self::FileUploadQueued => "file_upload_queued",
            Self::FileUploadRemoved => "file_upload_removed",
            Self::FileUploadRetry => "file_upload_retry",
            Self::FileUploadStarted => "file_upload_started",
            Self::FilesystemItemClosed => "filesystem_item_closed",
            Self::FilesystemItemEvicted => "filesystem_item_evicted",
            Self::FilesystemItemHandleClosed => "filesystem_item_handle_closed",
            Self::FilesystemItemHandleOpened => "filesystem_item_handle_opened",
            Self::FilesystemItemOpened => "filesystem_item_opened",
            Self::ItemTimeout => "item_timeout",
            Self::OrphanedFileDeleted => "orphaned_file_deleted",
            Self::OrphanedFileDetected => "orphaned_file_detected",
        }
    }

    /// Default severity for this kind.
    pub fn level(self) -> EventLevel {
        match self {
            Self::DownloadRestoreFailed | Self::FileUploadFailed => EventLevel::Error,
            Self::FileUploadNotFound | Self::OrphanedFileDeleted | Self::OrphanedFileDetected => {
                EventLevel::Warn
            }
            Self::FilesystemItemClosed
            | Self::FilesystemItemHandleClosed
            | Self::FilesystemItemHandleOpened
            | Self::FilesystemItemOpened => EventLevel::Trace,
            Self::FileUploadRemoved => EventLevel::Debug,
            _ => EventLevel::Info,
        }
    }
}

/// A single announcement: kind, level and ordered string fields.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub level: EventLevel,
    pub fields: Vec<(&'static str, String)>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            level: kind.level(),
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((name, value.into()));
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    /// One-line rendering, `kind|key|value|key|value`.
    pub fn single_line(&self) -> String {
        let mut line = self.kind.name().to_owned();
        for (key, value) in &self.fields {
            line.push('|');
            line.push_str(key);
            line.push('|');
            line.push_str(value);
        }
        line
    }
}

struct Subscriber {
    level: EventLevel,
    sender: Sender<Event>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    forwarder: Option<(Sender<Event>, JoinHandle<()>)>,
    started: bool,
}

/// Single-writer-many-readers event channel with explicit lifecycle.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start the bus. Emission before `start` (or after `stop`) is dropped.
    /// Spawns the log forwarder so every event reaches the `log` facade off
    /// the emitter's thread.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started {
            return;
        }
        state.started = true;

        let (tx, rx) = unbounded::<Event>();
        let handle = std::thread::Builder::new()
            .name("event-logger".to_owned())
            .spawn(move || {
                for event in rx.iter() {
                    forward_to_log(&event);
                }
            })
            .expect("failed to spawn event-logger thread");
        state.forwarder = Some((tx, handle));
    }

    /// Stop the bus, draining the forwarder and dropping all subscribers.
    pub fn stop(&self) {
        let forwarder = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.subscribers.clear();
            state.forwarder.take()
        };
        if let Some((tx, handle)) = forwarder {
            drop(tx);
            let _ = handle.join();
        }
    }

    /// Register a receiver for every event at `level` or more severe.
    pub fn subscribe(&self, level: EventLevel) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.state.lock().subscribers.push(Subscriber { level, sender: tx });
        rx
    }

    /// Publish an event to the forwarder and all matching subscribers.
    pub fn emit(&self, event: Event) {
        let mut state = self.state.lock();
        if !state.started {
            return;
        }
        if let Some((tx, _)) = &state.forwarder {
            let _ = tx.send(event.clone());
        }
        state
            .subscribers
            .retain(|sub| event.level > sub.level || sub.sender.send(event.clone()).is_ok());
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward_to_log(event: &Event) {
    match event.level {
        EventLevel::Critical | EventLevel::Error => error!("{}", event.single_line()),
        EventLevel::Warn => warn!("{}", event.single_line()),
        EventLevel::Info => info!("{}", event.single_line()),
        EventLevel::Debug => debug!("{}", event.single_line()),
        EventLevel::Trace => {
            if log_enabled!(log::Level::Trace) {
                trace!("{}", event.single_line());
            }
        }
    }
}
