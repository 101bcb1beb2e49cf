//! Cache eviction.
//!
//! A background loop watches the cache directory and, when usage crosses
//! the configured ceiling, retires the oldest unmodified, fully
//! downloaded, unpinned source files until usage falls under the low-water
//! mark. Files that no longer map to any item are orphans and are removed
//! outright.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::ApiError;
use crate::events::{Event, EventBus, EventKind};
use crate::file::table::OpenFileTable;
use crate::provider::Provider;
use crate::stop::StopSource;

/// Usage must drop below this fraction of the ceiling before a scan stops.
const LOW_WATER_FRACTION: f64 = 0.9;

#[derive(Clone, Debug)]
pub struct EvictionOptions {
    pub cache_directory: PathBuf,
    pub enable_max_cache_size: bool,
    pub max_cache_size_bytes: u64,
    pub check_interval: Duration,
    /// Order candidates by last access instead of last modification.
    pub uses_accessed_time: bool,
}

impl EvictionOptions {
    /// Derive every knob from the application config.
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            cache_directory: config.cache_directory(),
            enable_max_cache_size: config.enable_max_cache_size,
            max_cache_size_bytes: config.max_cache_size_bytes,
            check_interval: Duration::from_secs(config.eviction_delay_mins as u64 * 60),
            uses_accessed_time: config.eviction_uses_accessed_time,
        }
    }
}

pub struct Eviction {
    table: Arc<OpenFileTable>,
    provider: Arc<dyn Provider>,
    events: Arc<EventBus>,
    options: EvictionOptions,
    stop: StopSource,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Candidate {
    api_path: String,
    source_path: PathBuf,
    size: u64,
    ordering_time: SystemTime,
}

impl Eviction {
    pub fn new(
        table: Arc<OpenFileTable>,
        provider: Arc<dyn Provider>,
        events: Arc<EventBus>,
        options: EvictionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            table,
            provider,
            events,
            options,
            stop: StopSource::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            let this = Arc::clone(self);
            *worker = Some(
                std::thread::Builder::new()
                    .name("eviction".to_owned())
                    .spawn(move || this.run())
                    .expect("failed to spawn eviction thread"),
            );
        }
    }

    pub fn stop(&self) {
        self.stop.stop();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let token = self.stop.token();
        while !token.wait_for(self.options.check_interval) {
            self.check_items_thread();
        }
    }

    /// One pass over the cache directory.
    pub fn check_items_thread(&self) {
        if self.provider.is_direct_only() {
            return;
        }

        let mut candidates = Vec::new();
        let mut usage = 0u64;
        let entries = match std::fs::read_dir(&self.options.cache_directory) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "failed to scan cache directory {}: {err}",
                        self.options.cache_directory.display()
                    );
                }
                return;
            }
        };

        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            usage += meta.len();

            let source_path = entry.path();
            let source = source_path.to_string_lossy().into_owned();
            match self.provider.get_api_path_from_source(&source) {
                Ok(api_path) => {
                    let ordering_time = if self.options.uses_accessed_time {
                        meta.accessed().ok()
                    } else {
                        meta.modified().ok()
                    };
                    candidates.push(Candidate {
                        api_path,
                        source_path,
                        size: meta.len(),
                        ordering_time: ordering_time.unwrap_or(SystemTime::UNIX_EPOCH),
                    });
                }
                Err(ApiError::ItemNotFound) => self.remove_orphan(&source_path, meta.len(), &mut usage),
                Err(err) => {
                    debug!("skipping {source} during eviction scan: {err}");
                }
            }
        }

        if !self.options.enable_max_cache_size || usage <= self.options.max_cache_size_bytes {
            return;
        }

        let low_water =
            (self.options.max_cache_size_bytes as f64 * LOW_WATER_FRACTION) as u64;
        candidates.sort_by_key(|candidate| candidate.ordering_time);

        for candidate in candidates {
            if self.stop.is_stopped() || usage <= low_water {
                break;
            }
            if self.table.evict_file(&candidate.api_path) {
                usage = usage.saturating_sub(candidate.size);
            }
        }
    }

    fn remove_orphan(&self, source_path: &std::path::Path, size: u64, usage: &mut u64) {
        let source = source_path.to_string_lossy().into_owned();
        self.events.emit(
            Event::new(EventKind::OrphanedFileDetected).with("source", source.clone()),
        );
        match std::fs::remove_file(source_path) {
            Ok(()) => {
                *usage = usage.saturating_sub(size);
                self.events
                    .emit(Event::new(EventKind::OrphanedFileDeleted).with("source", source));
            }
            Err(err) => warn!("failed to delete orphaned file {source}: {err}"),
        }
    }
}
