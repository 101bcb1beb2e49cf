//! Open-file table.
//!
//! Keyed by api path, the table owns every live open-file instance, issues
//! handles to the mount layer, promotes read-only entries to writable when
//! write intent shows up, restores partially downloaded files from resume
//! records at startup, and runs the idle sweeper that closes files nobody
//! has touched lately.
//!
//! Lock order is table → per-file; the table lock is only write-held for
//! insert and remove of entries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{ApiError, ApiResult};
use crate::events::{Event, EventBus, EventKind};
use crate::file::open_file::{OpenFileConfig, WritableOpenFile};
use crate::file::ring_buffer::RingBufferOpenFile;
use crate::file::upload::UploadManager;
use crate::file::{OpenFile, UploadStore};
use crate::bit_set::BitSet;
use crate::provider::Provider;
use crate::stop::StopSource;
use crate::types::{
    DownloadType, FileHandle, FileMeta, FilesystemItem, HandleSource, META_PINNED, META_SOURCE,
    OpenFlags, meta_bool,
};

/// Table knobs copied out of the application config.
#[derive(Clone, Debug)]
pub struct TableOptions {
    pub cache_directory: PathBuf,
    pub ring_buffer_directory: PathBuf,
    pub chunk_size: u64,
    pub preferred_download_type: DownloadType,
    pub read_ahead_count: u64,
    pub retry_read_count: u16,
    pub ring_buffer_size: u64,
    /// Files whose `can_close()` holds and whose last access is older than
    /// this are closed by the sweeper.
    pub item_timeout: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
    pub enable_download_timeout: bool,
}

impl TableOptions {
    /// Derive every knob from the application config.
    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self {
            cache_directory: config.cache_directory(),
            ring_buffer_directory: config.ring_buffer_directory(),
            chunk_size: config.chunk_size(),
            preferred_download_type: config.preferred_download_type,
            read_ahead_count: config.read_ahead_count as u64,
            retry_read_count: config.retry_read_count(),
            ring_buffer_size: config.ring_buffer_file_size() as u64,
            item_timeout: Duration::from_secs(config.chunk_downloader_timeout_secs() as u64),
            sweep_interval: Duration::from_secs(config.med_frequency_interval_secs as u64),
            enable_download_timeout: config.enable_chunk_downloader_timeout,
        }
    }
}

#[derive(Default)]
struct TableState {
    files: HashMap<String, Arc<dyn OpenFile>>,
    handle_index: HashMap<FileHandle, String>,
}

pub struct OpenFileTable {
    provider: Arc<dyn Provider>,
    uploads: Arc<UploadManager>,
    events: Arc<EventBus>,
    options: TableOptions,
    handles: HandleSource,
    state: RwLock<TableState>,
    stop: StopSource,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl OpenFileTable {
    pub fn new(
        provider: Arc<dyn Provider>,
        uploads: Arc<UploadManager>,
        events: Arc<EventBus>,
        options: TableOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            uploads,
            events,
            options,
            handles: HandleSource::new(),
            state: RwLock::new(TableState::default()),
            stop: StopSource::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Restore resume records, wire upload completion back into the table,
    /// and start the idle sweeper.
    pub fn start(self: &Arc<Self>) {
        let completion_table = Arc::downgrade(self);
        self.uploads.set_completion_handler(Box::new(move |api_path, result| {
            if let Some(table) = completion_table.upgrade() {
                table.on_upload_complete(api_path, result);
            }
        }));

        self.restore_resume_entries();

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            let this = Arc::clone(self);
            *sweeper = Some(
                std::thread::Builder::new()
                    .name("table-sweeper".to_owned())
                    .spawn(move || this.sweep_loop())
                    .expect("failed to spawn table sweeper"),
            );
        }
    }

    /// Close every file and stop the sweeper. Modified, fully downloaded
    /// files queue their uploads on the way down.
    pub fn stop(&self) {
        self.stop.stop();
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }

        let files = {
            let mut state = self.state.write();
            state.handle_index.clear();
            std::mem::take(&mut state.files)
        };
        for (api_path, file) in files {
            let err = file.close();
            if err.is_error() {
                debug!("closed {api_path} with {err}");
            }
        }
    }

    // ---- open/create -------------------------------------------------------

    /// Open `api_path`, creating the open-file entry on first use. Returns
    /// the new handle and the entry.
    pub fn open(
        &self,
        api_path: &str,
        directory: bool,
        flags: OpenFlags,
    ) -> ApiResult<(FileHandle, Arc<dyn OpenFile>)> {
        let api_path = crate::api_path::create_api_path(api_path);

        if let Some(file) = self.lookup(&api_path) {
            return self.add_handle(file, flags);
        }

        let fsi = self.provider.get_filesystem_item(&api_path, directory)?;
        let file = self.instantiate(fsi, flags)?;

        let file = {
            let mut state = self.state.write();
            // Another thread may have inserted while we were constructing.
            if let Some(existing) = state.files.get(&api_path).cloned() {
                existing
            } else {
                state.files.insert(api_path.clone(), Arc::clone(&file));
                file
            }
        };
        self.add_handle(file, flags)
    }

    /// Create a brand-new file at the provider, then open it.
    pub fn create(
        &self,
        api_path: &str,
        meta: &FileMeta,
        flags: OpenFlags,
    ) -> ApiResult<(FileHandle, Arc<dyn OpenFile>)> {
        let api_path = crate::api_path::create_api_path(api_path);
        if self.lookup(&api_path).is_none() {
            self.provider.create_file(&api_path, meta)?;
        }
        self.open(&api_path, false, flags | OpenFlags::CREATE)
    }

    /// O(1) handle lookup through the side index.
    pub fn get(&self, handle: FileHandle) -> ApiResult<Arc<dyn OpenFile>> {
        let state = self.state.read();
        let api_path = state.handle_index.get(&handle).ok_or(ApiError::InvalidHandle)?;
        state
            .files
            .get(api_path)
            .cloned()
            .ok_or(ApiError::InvalidHandle)
    }

    pub fn get_open_file(&self, api_path: &str) -> Option<Arc<dyn OpenFile>> {
        self.lookup(&crate::api_path::create_api_path(api_path))
    }

    pub fn get_open_file_count(&self) -> usize {
        self.state.read().files.len()
    }

    /// Dispatch a handle close to the owning file. The entry stays in the
    /// table until the sweeper or eviction retires it.
    pub fn close(&self, handle: FileHandle) -> ApiResult<()> {
        let file = {
            let mut state = self.state.write();
            let api_path = state.handle_index.remove(&handle).ok_or(ApiError::InvalidHandle)?;
            state.files.get(&api_path).cloned().ok_or(ApiError::InvalidHandle)?
        };
        file.remove(handle);
        Ok(())
    }

    /// Swap a read-only entry for a writable one, carrying the open
    /// handles over. A no-op if the entry already supports writes.
    pub fn promote_to_writable(&self, handle: FileHandle) -> ApiResult<Arc<dyn OpenFile>> {
        let current = self.get(handle)?;
        if current.is_write_supported() {
            return Ok(current);
        }

        let api_path = current.get_api_path();
        let fsi = self.provider.get_filesystem_item(&api_path, false)?;
        let handles: Vec<_> = current
            .get_handles()
            .into_iter()
            .filter_map(|handle| current.get_open_flags(handle).map(|flags| (handle, flags)))
            .collect();

        let replacement = WritableOpenFile::new(
            &self.open_file_config(),
            fsi,
            Arc::clone(&self.provider),
            self.upload_store(),
            Arc::clone(&self.events),
        )?;
        for (handle, flags) in handles {
            replacement.add(handle, flags | OpenFlags::WRITE)?;
        }

        {
            let mut state = self.state.write();
            state
                .files
                .insert(api_path.clone(), Arc::clone(&replacement) as Arc<dyn OpenFile>);
        }
        current.close();
        debug!("promoted {api_path} to writable");
        Ok(replacement)
    }

    /// Whether the path has unfinished business: open state, an active
    /// download, or work anywhere in the upload pipeline.
    pub fn is_processing(&self, api_path: &str) -> bool {
        let api_path = crate::api_path::create_api_path(api_path);
        if self.uploads.is_processing(&api_path) {
            return true;
        }
        if let Some(file) = self.lookup(&api_path) {
            return file.is_modified()
                || file.is_download_active()
                || !file.is_complete()
                || file.get_open_file_count() > 0;
        }
        false
    }

    // ---- eviction ----------------------------------------------------------

    /// Evict the cached source file of `api_path`, if every invariant
    /// allows it. Returns whether the file was evicted.
    pub fn evict_file(&self, api_path: &str) -> bool {
        let api_path = crate::api_path::create_api_path(api_path);
        if self.provider.is_direct_only() {
            return false;
        }
        if self.is_processing(&api_path) {
            return false;
        }

        match self.provider.get_item_meta_value(&api_path, META_PINNED) {
            Ok(value) if meta_bool(&value) => return false,
            Ok(_) | Err(ApiError::ItemNotFound) => {}
            Err(_) => return false,
        }
        let source_path = match self.provider.get_item_meta_value(&api_path, META_SOURCE) {
            Ok(path) if !path.is_empty() => path,
            _ => return false,
        };

        // Re-verify under the table write lock; a racing open wins.
        {
            let mut state = self.state.write();
            if let Some(file) = state.files.get(&api_path).cloned() {
                if !(file.can_close() && !file.is_modified() && file.is_complete()) {
                    return false;
                }
                state.files.remove(&api_path);
                drop(state);
                file.close();
            }
        }

        if let Err(err) = std::fs::remove_file(&source_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to unlink {source_path} for eviction: {err}");
                return false;
            }
        }
        if let Err(err) = self.provider.set_item_meta(&api_path, META_SOURCE, "") {
            warn!("failed to clear source of evicted {api_path}: {err}");
        }

        self.events.emit(
            Event::new(EventKind::FilesystemItemEvicted)
                .with("api_path", api_path)
                .with("source", source_path),
        );
        true
    }

    // ---- internals ---------------------------------------------------------

    fn lookup(&self, api_path: &str) -> Option<Arc<dyn OpenFile>> {
        self.state.read().files.get(api_path).cloned()
    }

    fn upload_store(&self) -> Arc<dyn UploadStore> {
        Arc::clone(&self.uploads) as Arc<dyn UploadStore>
    }

    fn open_file_config(&self) -> OpenFileConfig {
        OpenFileConfig {
            chunk_size: self.options.chunk_size,
            download_type: self.options.preferred_download_type,
            read_ahead_count: self.options.read_ahead_count,
            retry_read_count: self.options.retry_read_count,
            cache_directory: self.options.cache_directory.clone(),
        }
    }

    fn instantiate(&self, fsi: FilesystemItem, flags: OpenFlags) -> ApiResult<Arc<dyn OpenFile>> {
        let use_ring = !fsi.directory
            && !self.provider.is_direct_only()
            && self.options.preferred_download_type == DownloadType::RingBuffer
            && !flags.wants_write()
            && fsi.size >= self.options.ring_buffer_size * self.options.chunk_size;

        if use_ring {
            match RingBufferOpenFile::new(
                &self.options.ring_buffer_directory,
                self.options.chunk_size,
                fsi.clone(),
                Arc::clone(&self.provider),
                Arc::clone(&self.events),
                self.options.ring_buffer_size,
            ) {
                Ok(file) => return Ok(file),
                Err(err) => {
                    warn!(
                        "ring buffer rejected for {} ({err}); falling back to writable",
                        fsi.api_path
                    );
                }
            }
        }

        Ok(WritableOpenFile::new(
            &self.open_file_config(),
            fsi,
            Arc::clone(&self.provider),
            self.upload_store(),
            Arc::clone(&self.events),
        )?)
    }

    fn add_handle(
        &self,
        file: Arc<dyn OpenFile>,
        flags: OpenFlags,
    ) -> ApiResult<(FileHandle, Arc<dyn OpenFile>)> {
        let handle = self.handles.next();
        let file = match file.add(handle, flags) {
            Ok(()) => file,
            Err(err) => {
                // A latched terminal error dies with the old instance; a
                // fresh open starts clean.
                if !file.can_close() {
                    return Err(err);
                }
                let api_path = file.get_api_path();
                debug!("reopening {api_path} after latched {err}");
                {
                    let mut state = self.state.write();
                    state.files.remove(&api_path);
                }
                file.close();
                let fsi = self
                    .provider
                    .get_filesystem_item(&api_path, file.is_directory())?;
                let fresh = self.instantiate(fsi, flags)?;
                fresh.add(handle, flags)?;
                self.state
                    .write()
                    .files
                    .insert(api_path, Arc::clone(&fresh));
                fresh
            }
        };

        self.state
            .write()
            .handle_index
            .insert(handle, file.get_api_path());
        Ok((handle, file))
    }

    fn on_upload_complete(&self, api_path: &str, result: ApiError) {
        if result != ApiError::Success {
            return;
        }
        if let Some(file) = self.lookup(api_path) {
            file.set_uploaded();
        }
    }

    /// Reconstruct partially downloaded files from resume records and
    /// restart their background fills.
    fn restore_resume_entries(&self) {
        for entry in self.uploads.get_resume_list() {
            let fsi = match self.provider.get_filesystem_item(&entry.api_path, false) {
                Ok(fsi) => fsi,
                Err(err) => {
                    self.events.emit(
                        Event::new(EventKind::DownloadRestoreFailed)
                            .with("api_path", entry.api_path.clone())
                            .with("source", entry.source_path.clone())
                            .with("result", err.to_string()),
                    );
                    self.uploads.remove_resume_record(&entry.api_path);
                    continue;
                }
            };

            let total_chunks = fsi.size.div_ceil(entry.chunk_size.max(1)) as usize;
            let read_state = BitSet::from_hex(&entry.read_state, total_chunks);
            let config = OpenFileConfig {
                chunk_size: entry.chunk_size.max(1),
                // Restored files always fill sequentially.
                download_type: DownloadType::Fallback,
                read_ahead_count: self.options.read_ahead_count,
                retry_read_count: self.options.retry_read_count,
                cache_directory: self.options.cache_directory.clone(),
            };

            match WritableOpenFile::restore(
                &config,
                fsi,
                read_state,
                Arc::clone(&self.provider),
                self.upload_store(),
                Arc::clone(&self.events),
            ) {
                Ok(file) => {
                    info!("restored partial download of {}", entry.api_path);
                    self.events.emit(
                        Event::new(EventKind::DownloadRestored)
                            .with("api_path", entry.api_path.clone())
                            .with("source", entry.source_path.clone())
                            .with("read_state", entry.read_state.clone()),
                    );
                    self.state
                        .write()
                        .files
                        .insert(entry.api_path.clone(), Arc::clone(&file) as Arc<dyn OpenFile>);
                    file.resume_download();
                }
                Err(err) => {
                    self.events.emit(
                        Event::new(EventKind::DownloadRestoreFailed)
                            .with("api_path", entry.api_path.clone())
                            .with("source", entry.source_path.clone())
                            .with("result", err.to_string()),
                    );
                    self.uploads.remove_resume_record(&entry.api_path);
                }
            }
        }
    }

    fn sweep_loop(&self) {
        let token = self.stop.token();
        while !token.wait_for(self.options.sweep_interval) {
            self.sweep_once();
        }
    }

    /// Close idle files. Files with zero handles and a stuck download are
    /// force-closed when the download timeout is enabled.
    fn sweep_once(&self) {
        let candidates: Vec<_> = {
            let state = self.state.read();
            state
                .files
                .iter()
                .map(|(api_path, file)| (api_path.clone(), Arc::clone(file)))
                .collect()
        };

        for (api_path, file) in candidates {
            let idle = file.get_last_access().elapsed() >= self.options.item_timeout;
            if !idle {
                continue;
            }

            let closeable = file.can_close();
            let stuck_download = self.options.enable_download_timeout
                && file.get_open_file_count() == 0
                && file.is_download_active()
                && !file.is_modified();
            if !closeable && !stuck_download {
                continue;
            }

            {
                let mut state = self.state.write();
                // Re-check under the write lock; an open may have raced in.
                if file.get_open_file_count() > 0 {
                    continue;
                }
                state.files.remove(&api_path);
            }
            file.close();
            self.events.emit(
                Event::new(EventKind::ItemTimeout).with("api_path", api_path.clone()),
            );
            debug!("timed out {api_path}");
        }
    }
}
