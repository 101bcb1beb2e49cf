//! Ring-buffer open file.
//!
//! Read-only variant for strictly sequential streaming of large objects:
//! instead of materializing the whole file it keeps a window of exactly
//! `ring_size` consecutive chunks in a flat on-disk ring. Chunk `c` always
//! occupies slot `c % ring_size`, so sliding the window never relocates a
//! still-valid chunk; a slot is cleared exactly when a new chunk rolls into
//! it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::warn;
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::bit_set::BitSet;
use crate::error::{ApiError, ApiResult};
use crate::events::{Event, EventBus, EventKind};
use crate::file::OpenFile;
use crate::file::source_file::SourceFile;
use crate::provider::Provider;
use crate::stop::StopSource;
use crate::types::{FileHandle, FilesystemItem, OpenFlags};

struct RingState {
    first_chunk: u64,
    last_chunk: u64,
    current_chunk: u64,
    /// Slot validity, indexed `chunk % ring_size`.
    ring_state: BitSet,
    in_flight: HashMap<u64, ()>,
    handles: HashMap<FileHandle, OpenFlags>,
    api_error: ApiError,
    last_access: Instant,
    closed: bool,
}

pub struct RingBufferOpenFile {
    fsi: FilesystemItem,
    chunk_size: u64,
    ring_size: u64,
    total_chunks: u64,
    provider: Arc<dyn Provider>,
    events: Arc<EventBus>,
    source: SourceFile,
    stop: StopSource,
    state: Mutex<RingState>,
    notify: Condvar,
}

impl RingBufferOpenFile {
    /// Create a ring over `fsi`, reserving `ring_size * chunk_size` bytes
    /// in `buffer_directory`. The file must span at least one full ring.
    pub fn new(
        buffer_directory: &Path,
        chunk_size: u64,
        fsi: FilesystemItem,
        provider: Arc<dyn Provider>,
        events: Arc<EventBus>,
        ring_size: u64,
    ) -> ApiResult<Arc<Self>> {
        if chunk_size == 0 {
            return Err(ApiError::EmptyRingBufferChunkSize);
        }
        if ring_size == 0 {
            return Err(ApiError::EmptyRingBufferSize);
        }
        if fsi.directory {
            return Err(ApiError::InvalidOperation);
        }
        let total_chunks = fsi.size.div_ceil(chunk_size);
        if total_chunks < ring_size {
            return Err(ApiError::InvalidRingBufferSize);
        }

        let source = SourceFile::new(buffer_directory.join(Uuid::new_v4().to_string()));
        source.allocate(ring_size * chunk_size)?;

        let state = RingState {
            first_chunk: 0,
            last_chunk: ring_size - 1,
            current_chunk: 0,
            ring_state: BitSet::new(ring_size as usize),
            in_flight: HashMap::new(),
            handles: HashMap::new(),
            api_error: ApiError::Success,
            last_access: Instant::now(),
            closed: false,
        };

        Ok(Arc::new(Self {
            fsi,
            chunk_size,
            ring_size,
            total_chunks,
            provider,
            events,
            source,
            stop: StopSource::new(),
            state: Mutex::new(state),
            notify: Condvar::new(),
        }))
    }

    pub fn get_total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn get_current_chunk(&self) -> u64 {
        self.state.lock().current_chunk
    }

    pub fn get_first_chunk(&self) -> u64 {
        self.state.lock().first_chunk
    }

    pub fn get_last_chunk(&self) -> u64 {
        self.state.lock().last_chunk
    }

    /// Position the window at `[first_chunk, first_chunk + ring_size)` with
    /// every slot marked valid and the read head at `current_chunk`.
    /// Intended for tests and for adopting pre-filled buffers.
    pub fn set(&self, first_chunk: u64, current_chunk: u64) {
        let mut state = self.state.lock();
        state.first_chunk = first_chunk;
        state.last_chunk = first_chunk + self.ring_size - 1;
        state.current_chunk = current_chunk;
        state.ring_state.set_all(true);
    }

    /// Advance the read head by `count`, clamped to the final chunk, and
    /// slide the window forward if the head moved past it. Chunks newly
    /// covered by the window have their slots cleared.
    pub fn forward(&self, count: u64) {
        let mut state = self.state.lock();
        self.forward_locked(&mut state, count);
    }

    fn forward_locked(&self, state: &mut RingState, count: u64) {
        let count = count.min(self.total_chunks - 1 - state.current_chunk);
        state.current_chunk += count;
        if state.current_chunk <= state.last_chunk {
            return;
        }

        let slide = state.current_chunk - state.last_chunk;
        if slide >= self.ring_size {
            state.ring_state.set_all(false);
        } else {
            for chunk in (state.last_chunk + 1)..=state.current_chunk {
                state
                    .ring_state
                    .set((chunk % self.ring_size) as usize, false);
            }
        }
        state.last_chunk = state.current_chunk;
        state.first_chunk = state.last_chunk - self.ring_size + 1;
    }

    /// Move the read head back by `count`, clamped to the first chunk, and
    /// slide the window backward if the head moved before it.
    pub fn reverse(&self, count: u64) {
        let mut state = self.state.lock();
        self.reverse_locked(&mut state, count);
    }

    fn reverse_locked(&self, state: &mut RingState, count: u64) {
        let count = count.min(state.current_chunk);
        state.current_chunk -= count;
        if state.current_chunk >= state.first_chunk {
            return;
        }

        let slide = state.first_chunk - state.current_chunk;
        if slide >= self.ring_size {
            state.ring_state.set_all(false);
        } else {
            for chunk in state.current_chunk..state.first_chunk {
                state
                    .ring_state
                    .set((chunk % self.ring_size) as usize, false);
            }
        }
        state.first_chunk = state.current_chunk;
        state.last_chunk = state.first_chunk + self.ring_size - 1;
    }

    fn slot_offset(&self, chunk: u64) -> u64 {
        (chunk % self.ring_size) * self.chunk_size
    }

    fn chunk_len(&self, chunk: u64) -> u64 {
        (self.fsi.size - chunk * self.chunk_size).min(self.chunk_size)
    }

    /// Block until `chunk` is valid in its slot, positioning the window and
    /// fetching from the provider as needed.
    fn ensure_chunk(&self, chunk: u64) -> ApiResult<()> {
        loop {
            let mut state = self.state.lock();
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            if state.closed || self.stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }

            if chunk > state.current_chunk {
                let delta = chunk - state.current_chunk;
                self.forward_locked(&mut state, delta);
            } else if chunk < state.current_chunk {
                let delta = state.current_chunk - chunk;
                self.reverse_locked(&mut state, delta);
            }

            let slot = (chunk % self.ring_size) as usize;
            if state.ring_state.get(slot) {
                return Ok(());
            }
            if state.in_flight.contains_key(&chunk) {
                self.notify.wait(&mut state);
                continue;
            }

            state.in_flight.insert(chunk, ());
            drop(state);

            let result = self.download_chunk(chunk);

            let mut state = self.state.lock();
            state.in_flight.remove(&chunk);
            match &result {
                Ok(()) => {
                    // Commit only if the window did not slide away while the
                    // provider call was in flight.
                    if chunk >= state.first_chunk && chunk <= state.last_chunk {
                        state.ring_state.set(slot, true);
                    }
                }
                Err(ApiError::DownloadStopped) => {}
                Err(err) => state.api_error = *err,
            }
            drop(state);
            self.notify.notify_all();
            result?;
        }
    }

    fn download_chunk(&self, chunk: u64) -> ApiResult<()> {
        let len = self.chunk_len(chunk);
        let mut data = Vec::new();
        self.provider.read_file_bytes(
            &self.fsi.api_path,
            len,
            chunk * self.chunk_size,
            &mut data,
            &self.stop.token(),
        )?;
        if data.len() as u64 != len {
            warn!(
                "short provider read for {} chunk {chunk}: {} != {len}",
                self.fsi.api_path,
                data.len()
            );
            return Err(ApiError::CommError);
        }
        self.source.write(self.slot_offset(chunk), &data)?;
        Ok(())
    }

    fn emit_item_event(&self, kind: EventKind, handle: Option<FileHandle>) {
        let mut event = Event::new(kind)
            .with("api_path", self.fsi.api_path.clone())
            .with("directory", "0")
            .with("source", self.source.path().to_string_lossy().into_owned());
        if let Some(handle) = handle {
            event = event.with("handle", handle.to_string());
        }
        self.events.emit(event);
    }
}

impl OpenFile for RingBufferOpenFile {
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
        if last {
            self.emit_item_event(EventKind::FilesystemItemClosed, None);
        }
    }

    fn read(&self, size: u64, offset: u64) -> ApiResult<Vec<u8>> {
        {
            let mut state = self.state.lock();
            if state.api_error.is_error() {
                return Err(state.api_error);
            }
            state.last_access = Instant::now();
        }
        if size == 0 || offset >= self.fsi.size {
            return Ok(Vec::new());
        }

        let len = size.min(self.fsi.size - offset);
        let mut data = Vec::with_capacity(len as usize);
        let mut position = offset;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = position / self.chunk_size;
            self.ensure_chunk(chunk)?;

            let intra = position % self.chunk_size;
            let take = remaining.min(self.chunk_len(chunk) - intra);
            let piece = self.source.read(self.slot_offset(chunk) + intra, take as usize)?;
            if piece.len() as u64 != take {
                return Err(ApiError::OsError);
            }
            data.extend_from_slice(&piece);
            position += take;
            remaining -= take;
        }
        Ok(data)
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> ApiResult<usize> {
        Err(ApiError::NotSupported)
    }

    fn resize(&self, _size: u64) -> ApiResult<()> {
        Err(ApiError::NotSupported)
    }

    fn close(&self) -> ApiError {
        {
            let mut state = self.state.lock();
            if state.closed {
                return state.api_error;
            }
            state.closed = true;
        }
        self.stop.stop();
        self.notify.notify_all();

        loop {
            let state = self.state.lock();
            if state.in_flight.is_empty() {
                break;
            }
            drop(state);
            std::thread::yield_now();
        }

        // The ring file holds no durable state; drop it with the window.
        if let Err(err) = self.source.unlink() {
            warn!(
                "failed to remove ring buffer file {}: {err}",
                self.source.path().display()
            );
        }
        self.state.lock().api_error
    }

    fn can_close(&self) -> bool {
        let state = self.state.lock();
        state.handles.is_empty() && state.in_flight.is_empty()
    }

    fn is_complete(&self) -> bool {
        false
    }

    fn is_directory(&self) -> bool {
        false
    }

    fn is_modified(&self) -> bool {
        false
    }

    fn is_write_supported(&self) -> bool {
        false
    }

    fn get_api_path(&self) -> String {
        self.fsi.api_path.clone()
    }

    fn get_api_error(&self) -> ApiError {
        self.state.lock().api_error
    }

    fn get_chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn get_file_size(&self) -> u64 {
        self.fsi.size
    }

    fn get_source_path(&self) -> String {
        self.source.path().to_string_lossy().into_owned()
    }

    fn get_filesystem_item(&self) -> FilesystemItem {
        self.fsi.clone()
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
        self.state.lock().ring_state.clone()
    }

    /// Slot validity for an absolute chunk number. Only meaningful for
    /// chunks inside the current window.
    fn get_read_state_for(&self, chunk: u64) -> bool {
        self.state
            .lock()
            .ring_state
            .get((chunk % self.ring_size) as usize)
    }

    fn get_last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    fn is_download_active(&self) -> bool {
        !self.state.lock().in_flight.is_empty()
    }
}

impl Drop for RingBufferOpenFile {
    fn drop(&mut self) {
        if !self.state.lock().closed {
            self.close();
        }
    }
}
