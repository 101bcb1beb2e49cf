//! Writable open file.
//!
//! One instance owns all I/O state for a single api path while it sits in
//! the open-file table: the sparse source file, the per-chunk read/write
//! bitmaps, the handle set and the modification flag. Reads block until
//! the covered chunks are materialized from the provider; writes coalesce
//! into the source file and mark the file for upload on close.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::bit_set::BitSet;
use crate::error::{ApiError, ApiResult};
use crate::events::{Event, EventBus, EventKind};
use crate::file::source_file::SourceFile;
use crate::file::{OpenFile, UploadStore};
use crate::provider::Provider;
use crate::stop::StopSource;
use crate::types::{
    DownloadType, FileHandle, FilesystemItem, META_CHANGED, META_MODIFIED, META_SIZE, META_SOURCE,
    META_WRITTEN, OpenFlags, unix_time_now,
};

const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Per-file knobs copied out of the application config.
#[derive(Clone, Debug)]
pub struct OpenFileConfig {
    pub chunk_size: u64,
    pub download_type: DownloadType,
    pub read_ahead_count: u64,
    pub retry_read_count: u16,
    pub cache_directory: PathBuf,
}

// Waiters for an in-flight chunk park here; the downloader flips `done`
// and broadcasts.
struct ChunkWait {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ChunkWait {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

struct FileState {
    api_parent: String,
    size: u64,
    source_path: String,
    read_state: BitSet,
    write_state: BitSet,
    handles: HashMap<FileHandle, OpenFlags>,
    modified: bool,
    upload_queued: bool,
    api_error: ApiError,
    last_access: Instant,
    /// Chunk range the fallback filler is working through.
    active_download: Option<(u64, u64)>,
    filler_active: bool,
    /// Per-chunk conditions for in-flight direct downloads.
    active_chunks: HashMap<u64, Arc<ChunkWait>>,
    threads: Vec<JoinHandle<()>>,
    closed: bool,
}

pub struct WritableOpenFile {
    api_path: String,
    directory: bool,
    chunk_size: u64,
    download_type: DownloadType,
    read_ahead_count: u64,
    retry_read_count: u16,
    provider: Arc<dyn Provider>,
    uploads: Arc<dyn UploadStore>,
    events: Arc<EventBus>,
    source: SourceFile,
    stop: StopSource,
    weak: Weak<WritableOpenFile>,
    state: Mutex<FileState>,
    // Wakes fallback waiters and anyone watching bitmap/error transitions.
    notify: Condvar,
}

impl WritableOpenFile {
    /// Open `fsi` for caching.
    ///
    /// A non-empty file whose recorded source file already holds exactly
    /// `fsi.size` bytes is adopted as fully downloaded. Any mismatch
    /// allocates a fresh UUID source path, records it in the meta store and
    /// drops the stale resume record.
    pub fn new(
        config: &OpenFileConfig,
        fsi: FilesystemItem,
        provider: Arc<dyn Provider>,
        uploads: Arc<dyn UploadStore>,
        events: Arc<EventBus>,
    ) -> ApiResult<Arc<Self>> {
        Self::build(config, fsi, None, provider, uploads, events)
    }

    /// Reconstruct a partially downloaded file from its resume record.
    /// The stored bitmap is trusted and the file starts out modified.
    pub fn restore(
        config: &OpenFileConfig,
        fsi: FilesystemItem,
        read_state: BitSet,
        provider: Arc<dyn Provider>,
        uploads: Arc<dyn UploadStore>,
        events: Arc<EventBus>,
    ) -> ApiResult<Arc<Self>> {
        Self::build(config, fsi, Some(read_state), provider, uploads, events)
    }

    fn build(
        config: &OpenFileConfig,
        mut fsi: FilesystemItem,
        restore_state: Option<BitSet>,
        provider: Arc<dyn Provider>,
        uploads: Arc<dyn UploadStore>,
        events: Arc<EventBus>,
    ) -> ApiResult<Arc<Self>> {
        if config.chunk_size == 0 {
            return Err(ApiError::InvalidOperation);
        }

        let total_chunks = fsi.size.div_ceil(config.chunk_size) as usize;
        let restoring = restore_state.is_some();
        let mut read_state = restore_state.unwrap_or_else(|| BitSet::new(total_chunks));
        if read_state.len() != total_chunks {
            read_state.resize(total_chunks);
        }

        let direct_only = provider.is_direct_only();
        if !direct_only && !restoring && !fsi.directory {
            if fsi.size > 0 {
                let on_disk = std::fs::metadata(&fsi.source_path)
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                if !fsi.source_path.is_empty() && on_disk == fsi.size {
                    // Local copy is current; every chunk is valid.
                    read_state.set_all(true);
                } else {
                    let old_source = std::mem::take(&mut fsi.source_path);
                    fsi.source_path = fresh_source_path(&config.cache_directory);
                    provider.set_item_meta(&fsi.api_path, META_SOURCE, &fsi.source_path)?;
                    uploads.remove_resume(&fsi.api_path, &old_source);
                }
            } else if fsi.source_path.is_empty() {
                fsi.source_path = fresh_source_path(&config.cache_directory);
                provider.set_item_meta(&fsi.api_path, META_SOURCE, &fsi.source_path)?;
            }
        }

        let state = FileState {
            api_parent: fsi.api_parent.clone(),
            size: fsi.size,
            source_path: fsi.source_path.clone(),
            read_state,
            write_state: BitSet::new(total_chunks),
            handles: HashMap::new(),
            modified: restoring,
            upload_queued: false,
            api_error: ApiError::Success,
            last_access: Instant::now(),
            active_download: None,
            filler_active: false,
            active_chunks: HashMap::new(),
            threads: Vec::new(),
            closed: false,
        };

        Ok(Arc::new_cyclic(|weak| Self {
            api_path: fsi.api_path,
            directory: fsi.directory,
            chunk_size: config.chunk_size,
            download_type: config.download_type,
            read_ahead_count: config.read_ahead_count,
            retry_read_count: config.retry_read_count.max(1),
            provider,
            uploads,
            events,
            source: SourceFile::new(&fsi.source_path),
            stop: StopSource::new(),
            weak: weak.clone(),
            state: Mutex::new(state),
            notify: Condvar::new(),
        }))
    }

    /// Chunks dirtied by user writes since the last completed upload.
    pub fn get_write_state(&self) -> BitSet {
        self.state.lock().write_state.clone()
    }

    fn total_chunks(size: u64, chunk_size: u64) -> usize {
        size.div_ceil(chunk_size) as usize
    }

    fn chunk_len(&self, chunk: u64, size: u64) -> u64 {
        (size - chunk * self.chunk_size).min(self.chunk_size)
    }

    // ---- chunk acquisition -------------------------------------------------

    /// Block until every chunk covering `[offset, offset + len)` is valid
    /// on disk.
    fn ensure_range(&self, offset: u64, len: u64) -> ApiResult<()> {
        if len == 0 {
            return Ok(());
        }
        let first = offset / self.chunk_size;
        let last = (offset + len - 1) / self.chunk_size;
        match self.download_type {
            DownloadType::Fallback => self.wait_for_range_fallback(first, last),
            _ => {
                for chunk in first..=last {
                    self.ensure_chunk_direct(chunk)?;
                }
                self.spawn_read_ahead(last + 1);
                Ok(())
            }
        }
    }

    /// Direct policy: downloads run on the calling thread under a
    /// per-chunk condition so readers of different chunks proceed in
    /// parallel while readers of the same chunk share one provider call.
    fn ensure_chunk_direct(&self, chunk: u64) -> ApiResult<()> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                if state.api_error.is_error() {
                    return Err(state.api_error);
                }
                if chunk as usize >= state.read_state.len() || state.read_state.get(chunk as usize)
                {
                    return Ok(());
                }
                if let Some(wait) = state.active_chunks.get(&chunk).cloned() {
                    wait
                } else {
                    let wait = ChunkWait::new();
                    state.active_chunks.insert(chunk, Arc::clone(&wait));
                    drop(state);
                    let result = self.download_chunk(chunk);
                    self.finish_chunk(chunk, &wait, &result);
                    return result;
                }
            };
            wait.wait();
        }
    }

    /// Fetch one chunk from the provider and write it to the source file.
    /// Does not touch bitmaps; callers commit through [`Self::finish_chunk`].
    fn download_chunk(&self, chunk: u64) -> ApiResult<()> {
        let size = self.state.lock().size;
        let len = self.chunk_len(chunk, size);
        let offset = chunk * self.chunk_size;
        let token = self.stop.token();

        let mut attempt = 0u16;
        loop {
            if token.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }

            let mut data = Vec::new();
            match self
                .provider
                .read_file_bytes(&self.api_path, len, offset, &mut data, &token)
            {
                Ok(()) => {
                    if data.len() as u64 != len {
                        warn!(
                            "short provider read for {} chunk {chunk}: {} != {len}",
                            self.api_path,
                            data.len()
                        );
                        return Err(ApiError::CommError);
                    }
                    self.source.write(offset, &data)?;
                    return Ok(());
                }
                Err(ApiError::DownloadStopped) => return Err(ApiError::DownloadStopped),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retry_read_count {
                        return Err(err);
                    }
                    debug!(
                        "retrying chunk {chunk} of {} after {err} (attempt {attempt})",
                        self.api_path
                    );
                    if token.wait_for(RETRY_PAUSE) {
                        return Err(ApiError::DownloadStopped);
                    }
                }
            }
        }
    }

    fn finish_chunk(&self, chunk: u64, wait: &ChunkWait, result: &ApiResult<()>) {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                if (chunk as usize) < state.read_state.len() {
                    state.read_state.set(chunk as usize, true);
                }
            }
            Err(ApiError::DownloadStopped) => {}
            Err(err) => {
                state.api_error = *err;
            }
        }
        state.active_chunks.remove(&chunk);
        drop(state);
        wait.complete();
        self.notify.notify_all();
    }

    /// Kick off background fetches for up to `read_ahead_count` chunks
    /// beyond the one just served.
    fn spawn_read_ahead(&self, from_chunk: u64) {
        if self.read_ahead_count == 0 {
            return;
        }
        let Some(this) = self.weak.upgrade() else {
            return;
        };

        let mut state = self.state.lock();
        if state.closed || state.api_error.is_error() {
            return;
        }
        let total = state.read_state.len() as u64;
        let end = (from_chunk + self.read_ahead_count).min(total);
        for chunk in from_chunk..end {
            if state.read_state.get(chunk as usize)
                || state.active_chunks.contains_key(&chunk)
                || state.active_chunks.len() as u64 >= self.read_ahead_count
            {
                continue;
            }
            let wait = ChunkWait::new();
            state.active_chunks.insert(chunk, Arc::clone(&wait));
            let this = Arc::clone(&this);
            let wait_for_thread = Arc::clone(&wait);
            let handle = std::thread::Builder::new()
                .name(format!("chunk-fetch-{chunk}"))
                .spawn(move || {
                    let result = this.download_chunk(chunk);
                    this.finish_chunk(chunk, &wait_for_thread, &result);
                });
            match handle {
                Ok(handle) => state.threads.push(handle),
                Err(err) => {
                    warn!("failed to spawn read-ahead thread: {err}");
                    state.active_chunks.remove(&chunk);
                    wait.complete();
                }
            }
        }
        state.threads.retain(|thread| !thread.is_finished());
    }

    /// Fallback policy: a single filler advances toward EOF while readers
    /// wait on the bitmap.
    fn wait_for_range_fallback(&self, first: u64, last: u64) -> ApiResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            let done = (first..=last).all(|chunk| {
                chunk as usize >= state.read_state.len() || state.read_state.get(chunk as usize)
            });
            if done {
                return Ok(());
            }
            if self.stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            if !state.filler_active {
                self.start_filler_locked(&mut state, first);
            }
            self.notify.wait(&mut state);
        }
    }

    fn start_filler_locked(&self, state: &mut FileState, from_chunk: u64) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        if state.filler_active || state.closed {
            return;
        }
        state.filler_active = true;
        state.active_download = Some((from_chunk, state.read_state.len() as u64));

        let handle = std::thread::Builder::new()
            .name("chunk-filler".to_owned())
            .spawn(move || this.run_filler(from_chunk));
        match handle {
            Ok(handle) => state.threads.push(handle),
            Err(err) => {
                warn!("failed to spawn filler thread: {err}");
                state.filler_active = false;
                state.active_download = None;
            }
        }
    }

    fn run_filler(self: Arc<Self>, from_chunk: u64) {
        let token = self.stop.token();
        let mut cursor = from_chunk as usize;
        loop {
            if token.is_stopped() {
                break;
            }
            let next = {
                let mut state = self.state.lock();
                if state.api_error.is_error() {
                    None
                } else {
                    let next = state
                        .read_state
                        .first_clear_from(cursor)
                        .or_else(|| state.read_state.first_clear_from(0));
                    if let Some(next) = next {
                        state.active_download = Some((next as u64, state.read_state.len() as u64));
                    }
                    next
                }
            };
            let Some(next) = next else { break };

            // Chunks are acquired through the shared per-chunk protocol so
            // the filler and a read-before-write never race on one chunk.
            if self.ensure_chunk_direct(next as u64).is_err() {
                break;
            }
            cursor = next + 1;
        }

        let queue = {
            let mut state = self.state.lock();
            state.filler_active = false;
            state.active_download = None;
            let queue = state.modified
                && !state.upload_queued
                && state.handles.is_empty()
                && state.read_state.all()
                && !state.api_error.is_error();
            if queue {
                state.upload_queued = true;
            }
            queue
        };
        self.notify.notify_all();

        // A restored file finishes its download with no handles open; the
        // upload it was closed for can now proceed.
        if queue {
            self.uploads.queue_upload(self.as_ref());
        }
    }

    // ---- mutation helpers --------------------------------------------------

    /// First mutation: cancel any stale queued upload, then persist the
    /// resume record so the modification survives a crash.
    fn begin_modify(&self) {
        let first = {
            let mut state = self.state.lock();
            let first = !state.modified;
            state.modified = true;
            first
        };
        if first {
            self.uploads.remove_upload(&self.api_path);
        }
    }

    fn update_meta(&self, size: Option<u64>) {
        let now = unix_time_now();
        let mut meta = crate::types::FileMeta::new();
        meta.insert(META_CHANGED.to_owned(), now.clone());
        meta.insert(META_MODIFIED.to_owned(), now.clone());
        meta.insert(META_WRITTEN.to_owned(), now);
        if let Some(size) = size {
            meta.insert(META_SIZE.to_owned(), size.to_string());
        }
        if let Err(err) = self.provider.set_item_meta_map(&self.api_path, &meta) {
            warn!("failed to update meta for {}: {err}", self.api_path);
        }
    }

    /// Growing the file past a partial final chunk first materializes that
    /// chunk; its provider-side bytes would otherwise be lost behind the
    /// zero tail.
    fn prepare_grow(&self, old_size: u64) -> ApiResult<()> {
        if old_size == 0 || old_size % self.chunk_size == 0 {
            return Ok(());
        }
        let last = (old_size - 1) / self.chunk_size;
        let needs_read = {
            let state = self.state.lock();
            !state.read_state.get(last as usize)
        };
        if needs_read {
            self.ensure_chunk_direct(last)?;
        }
        Ok(())
    }

    fn emit_item_event(&self, kind: EventKind, handle: Option<FileHandle>) {
        let state = self.state.lock();
        let mut event = Event::new(kind)
            .with("api_path", self.api_path.clone())
            .with("directory", if self.directory { "1" } else { "0" })
            .with("source", state.source_path.clone());
        drop(state);
        if let Some(handle) = handle {
            event = event.with("handle", handle.to_string());
        }
        self.events.emit(event);
    }
}

impl OpenFile for WritableOpenFile {
    fn add(&self, handle: FileHandle, flags: OpenFlags) -> ApiResult<()> {
        let first = {
            let mut state = self.state.lock();
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            state.last_access = Instant::now();
            let first = state.handles.is_empty();
            state.handles.insert(handle, flags);
            first
        };

        if first {
            self.emit_item_event(EventKind::FilesystemItemOpened, None);
        }
        self.emit_item_event(EventKind::FilesystemItemHandleOpened, Some(handle));
        Ok(())
    }

    fn remove(&self, handle: FileHandle) {
        let last = {
            let mut state = self.state.lock();
            if state.handles.remove(&handle).is_none() {
                return;
            }
            state.last_access = Instant::now();
            state.handles.is_empty()
        };
        self.emit_item_event(EventKind::FilesystemItemHandleClosed, Some(handle));
        if !last {
            return;
        }
        self.emit_item_event(EventKind::FilesystemItemClosed, None);

        let (modified, complete, queue) = {
            let mut state = self.state.lock();
            let complete = state.read_state.all();
            let queue = state.modified && complete && !state.upload_queued;
            if queue {
                state.upload_queued = true;
            }
            (state.modified, complete, queue)
        };

        if queue {
            self.update_meta(None);
            self.uploads.queue_upload(self);
        } else if modified && !complete {
            // Download-incomplete state survives the restart.
            self.uploads.store_resume(self);
            let state = self.state.lock();
            let event = Event::new(EventKind::DownloadStored)
                .with("api_path", self.api_path.clone())
                .with("source", state.source_path.clone())
                .with("read_state", state.read_state.to_hex());
            drop(state);
            self.events.emit(event);
        }
    }

    fn read(&self, size: u64, offset: u64) -> ApiResult<Vec<u8>> {
        if self.directory {
            return Err(ApiError::InvalidOperation);
        }

        if self.provider.is_direct_only() {
            let mut data = Vec::new();
            self.provider.read_file_bytes(
                &self.api_path,
                size,
                offset,
                &mut data,
                &self.stop.token(),
            )?;
            return Ok(data);
        }

        let file_size = {
            let mut state = self.state.lock();
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            state.last_access = Instant::now();
            state.size
        };
        if size == 0 || offset >= file_size {
            return Ok(Vec::new());
        }

        let len = size.min(file_size - offset);
        self.ensure_range(offset, len)?;
        self.source.read(offset, len as usize)
    }

    fn write(&self, offset: u64, data: &[u8]) -> ApiResult<usize> {
        if self.directory {
            return Err(ApiError::InvalidOperation);
        }
        if self.provider.is_direct_only() {
            return Err(ApiError::NotSupported);
        }
        if data.is_empty() {
            return Ok(0);
        }

        {
            let mut state = self.state.lock();
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            state.last_access = Instant::now();
        }

        self.begin_modify();

        let end = offset + data.len() as u64;
        let old_size = self.state.lock().size;
        let first = offset / self.chunk_size;
        let last = (end - 1) / self.chunk_size;

        // Read-before-write: every touched chunk that has provider-side
        // bytes must be valid locally before user data lands on top,
        // otherwise a later sequential fill would clobber it.
        let existing_last = if old_size == 0 {
            None
        } else {
            Some((old_size - 1) / self.chunk_size)
        };
        if let Some(existing_last) = existing_last {
            for chunk in first..=last.min(existing_last) {
                self.ensure_chunk_direct(chunk)?;
            }
        }
        if end > old_size {
            self.prepare_grow(old_size)?;
        }

        self.source.write(offset, data)?;

        let size_changed = {
            let mut state = self.state.lock();
            let new_size = state.size.max(end);
            let size_changed = new_size != state.size;
            if size_changed {
                let total = Self::total_chunks(new_size, self.chunk_size);
                let old_total = state.read_state.len();
                state.read_state.resize(total);
                state.write_state.resize(total);
                // Everything past the old chunk count is locally
                // authoritative; the provider has no bytes there.
                for chunk in old_total..total {
                    state.read_state.set(chunk, true);
                }
                state.size = new_size;
            }
            for chunk in first..=last {
                state.read_state.set(chunk as usize, true);
                state.write_state.set(chunk as usize, true);
            }
            size_changed.then_some(state.size)
        };

        self.update_meta(size_changed);
        self.uploads.store_resume(self);
        Ok(data.len())
    }

    fn resize(&self, size: u64) -> ApiResult<()> {
        if self.directory {
            return Err(ApiError::InvalidOperation);
        }
        if self.provider.is_direct_only() {
            return Err(ApiError::NotSupported);
        }

        let old_size = {
            let mut state = self.state.lock();
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            state.last_access = Instant::now();
            state.size
        };
        if size == old_size {
            return Ok(());
        }

        self.begin_modify();

        if size > old_size {
            self.prepare_grow(old_size)?;
            self.source.allocate(size)?;
        } else {
            self.source.truncate(size)?;
        }

        {
            let mut state = self.state.lock();
            let total = Self::total_chunks(size, self.chunk_size);
            let old_total = state.read_state.len();
            state.read_state.resize(total);
            state.write_state.resize(total);
            for chunk in old_total..total {
                // The grown tail is zero-filled locally and authoritative.
                state.read_state.set(chunk, true);
                state.write_state.set(chunk, true);
            }
            state.size = size;
        }

        self.update_meta(Some(size));
        self.uploads.store_resume(self);
        self.notify.notify_all();
        Ok(())
    }

    fn close(&self) -> ApiError {
        {
            let state = self.state.lock();
            if state.closed {
                return state.api_error;
            }
        }

        self.stop.stop();
        self.notify.notify_all();

        // Wait out every download thread before latching final state. A
        // download thread can itself drop the last reference and end up
        // here; it must not join its own handle.
        let current = std::thread::current().id();
        let threads = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.threads)
        };
        let mut on_own_thread = false;
        for thread in threads {
            if thread.thread().id() == current {
                on_own_thread = true;
                continue;
            }
            let _ = thread.join();
        }
        while !on_own_thread {
            let state = self.state.lock();
            if state.active_chunks.is_empty() && !state.filler_active {
                break;
            }
            drop(state);
            std::thread::yield_now();
        }

        let store = {
            let mut state = self.state.lock();
            state.closed = true;
            let complete = state.read_state.all();
            let mut store = false;
            if state.size > 0 && !complete {
                if state.modified {
                    state.api_error = ApiError::DownloadIncomplete;
                    store = true;
                } else if !state.api_error.is_error() {
                    state.api_error = ApiError::DownloadStopped;
                }
            } else if state.modified && complete && !state.upload_queued {
                state.upload_queued = true;
                drop(state);
                self.update_meta(None);
                self.uploads.queue_upload(self);
                if self.source.exists() {
                    let _ = self.source.flush();
                }
                self.source.close();
                return self.state.lock().api_error;
            }
            store
        };

        if store {
            self.uploads.store_resume(self);
        }
        if self.source.exists() {
            let _ = self.source.flush();
        }
        self.source.close();
        self.state.lock().api_error
    }

    fn can_close(&self) -> bool {
        let state = self.state.lock();
        state.handles.is_empty()
            && !state.modified
            && state.active_chunks.is_empty()
            && !state.filler_active
    }

    fn is_complete(&self) -> bool {
        self.state.lock().read_state.all()
    }

    fn is_directory(&self) -> bool {
        self.directory
    }

    fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    fn is_write_supported(&self) -> bool {
        true
    }

    fn get_api_path(&self) -> String {
        self.api_path.clone()
    }

    fn get_api_error(&self) -> ApiError {
        self.state.lock().api_error
    }

    fn get_chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn get_file_size(&self) -> u64 {
        self.state.lock().size
    }

    fn get_source_path(&self) -> String {
        self.state.lock().source_path.clone()
    }

    fn get_filesystem_item(&self) -> FilesystemItem {
        let state = self.state.lock();
        FilesystemItem {
            api_path: self.api_path.clone(),
            api_parent: state.api_parent.clone(),
            directory: self.directory,
            size: state.size,
            source_path: state.source_path.clone(),
        }
    }

    fn get_open_file_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    fn get_handles(&self) -> Vec<FileHandle> {
        self.state.lock().handles.keys().copied().collect()
    }

    fn get_open_flags(&self, handle: FileHandle) -> Option<OpenFlags> {
        self.state.lock().handles.get(&handle).copied()
    }

    fn get_read_state(&self) -> BitSet {
        self.state.lock().read_state.clone()
    }

    fn get_read_state_for(&self, chunk: u64) -> bool {
        let state = self.state.lock();
        (chunk as usize) < state.read_state.len() && state.read_state.get(chunk as usize)
    }

    fn get_last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    fn is_download_active(&self) -> bool {
        let state = self.state.lock();
        !state.active_chunks.is_empty() || state.filler_active
    }

    fn set_uploaded(&self) {
        let mut state = self.state.lock();
        state.modified = false;
        state.upload_queued = false;
        state.write_state.set_all(false);
        state.last_access = Instant::now();
        drop(state);
        self.notify.notify_all();
    }

    fn resume_download(&self) {
        let mut state = self.state.lock();
        if state.read_state.all() {
            let queue = state.modified && !state.upload_queued && state.handles.is_empty();
            if queue {
                state.upload_queued = true;
                drop(state);
                self.uploads.queue_upload(self);
            }
            return;
        }
        let from = state.read_state.first_clear_from(0).unwrap_or(0) as u64;
        self.start_filler_locked(&mut state, from);
    }
}

impl Drop for WritableOpenFile {
    fn drop(&mut self) {
        if !self.state.lock().closed {
            self.close();
        }
    }
}

fn fresh_source_path(cache_directory: &std::path::Path) -> String {
    cache_directory
        .join(Uuid::new_v4().to_string())
        .to_string_lossy()
        .into_owned()
}
