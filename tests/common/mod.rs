//! Shared fixtures: a scriptable in-memory provider and event capture.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use cachefs::{
    ApiError, ApiResult, DirectoryItem, Event, EventBus, EventKind, EventLevel, FileMeta,
    FilesystemItem, META_DIRECTORY, META_PINNED, META_SIZE, META_SOURCE, Provider, StopToken,
};

pub const CHUNK: u64 = 1024;

#[derive(Default)]
struct ProviderState {
    items: HashMap<String, FilesystemItem>,
    meta: HashMap<String, FileMeta>,
    remote: HashMap<String, Vec<u8>>,
    read_log: Vec<(u64, u64)>,
    upload_log: Vec<(String, String)>,
    fail_read: Option<ApiError>,
    /// Reads at or beyond this offset park until the stop token fires.
    block_read_at: Option<u64>,
    fail_upload: Vec<ApiError>,
    block_upload: bool,
    direct_only: bool,
}

/// In-memory provider whose failure modes the tests script directly.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a remote file with `contents` and a recorded source path.
    pub fn add_file(&self, api_path: &str, contents: Vec<u8>, source_path: &str) {
        let mut state = self.state.lock();
        state.items.insert(
            api_path.to_owned(),
            FilesystemItem {
                api_path: api_path.to_owned(),
                api_parent: cachefs::api_path::get_parent_api_path(api_path),
                directory: false,
                size: contents.len() as u64,
                source_path: source_path.to_owned(),
            },
        );
        let mut meta = FileMeta::new();
        meta.insert(META_DIRECTORY.to_owned(), "false".to_owned());
        meta.insert(META_SIZE.to_owned(), contents.len().to_string());
        meta.insert(META_SOURCE.to_owned(), source_path.to_owned());
        state.meta.insert(api_path.to_owned(), meta);
        state.remote.insert(api_path.to_owned(), contents);
    }

    /// Advertise a size larger than the stored bytes, so provider reads
    /// come back short.
    pub fn set_advertised_size(&self, api_path: &str, size: u64) {
        let mut state = self.state.lock();
        if let Some(item) = state.items.get_mut(api_path) {
            item.size = size;
        }
    }

    pub fn set_fail_read(&self, err: Option<ApiError>) {
        self.state.lock().fail_read = err;
    }

    pub fn set_block_read_at(&self, offset: Option<u64>) {
        self.state.lock().block_read_at = offset;
    }

    pub fn set_direct_only(&self, value: bool) {
        self.state.lock().direct_only = value;
    }

    pub fn set_block_upload(&self, value: bool) {
        self.state.lock().block_upload = value;
    }

    /// Queue upload failures; each upload call consumes one.
    pub fn push_upload_failure(&self, err: ApiError) {
        self.state.lock().fail_upload.push(err);
    }

    pub fn read_log(&self) -> Vec<(u64, u64)> {
        self.state.lock().read_log.clone()
    }

    pub fn upload_log(&self) -> Vec<(String, String)> {
        self.state.lock().upload_log.clone()
    }

    pub fn remote_contents(&self, api_path: &str) -> Option<Vec<u8>> {
        self.state.lock().remote.get(api_path).cloned()
    }

    pub fn set_pinned(&self, api_path: &str, pinned: bool) {
        let mut state = self.state.lock();
        state
            .meta
            .entry(api_path.to_owned())
            .or_default()
            .insert(META_PINNED.to_owned(), pinned.to_string());
    }
}

impl Provider for MockProvider {
    fn get_filesystem_item(&self, api_path: &str, directory: bool) -> ApiResult<FilesystemItem> {
        let state = self.state.lock();
        let item = state.items.get(api_path).ok_or(if directory {
            ApiError::DirectoryNotFound
        } else {
            ApiError::ItemNotFound
        })?;
        if item.directory != directory {
            return Err(if directory {
                ApiError::DirectoryNotFound
            } else {
                ApiError::ItemNotFound
            });
        }
        Ok(item.clone())
    }

    fn get_item_meta(&self, api_path: &str) -> ApiResult<FileMeta> {
        self.state
            .lock()
            .meta
            .get(api_path)
            .cloned()
            .ok_or(ApiError::ItemNotFound)
    }

    fn get_item_meta_value(&self, api_path: &str, key: &str) -> ApiResult<String> {
        let state = self.state.lock();
        state
            .meta
            .get(api_path)
            .and_then(|meta| meta.get(key))
            .cloned()
            .ok_or(ApiError::ItemNotFound)
    }

    fn set_item_meta(&self, api_path: &str, key: &str, value: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        state
            .meta
            .entry(api_path.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        if key == META_SOURCE {
            if let Some(item) = state.items.get_mut(api_path) {
                item.source_path = value.to_owned();
            }
        }
        Ok(())
    }

    fn set_item_meta_map(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()> {
        for (key, value) in meta {
            self.set_item_meta(api_path, key, value)?;
        }
        if let Some(size) = meta.get(META_SIZE).and_then(|value| value.parse().ok()) {
            let mut state = self.state.lock();
            if let Some(item) = state.items.get_mut(api_path) {
                item.size = size;
            }
        }
        Ok(())
    }

    fn read_file_bytes(
        &self,
        api_path: &str,
        size: u64,
        offset: u64,
        data: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        let block = {
            let mut state = self.state.lock();
            state.read_log.push((offset, size));
            if let Some(err) = state.fail_read {
                return Err(err);
            }
            matches!(state.block_read_at, Some(at) if offset >= at)
        };
        if block {
            while !stop.wait_for(Duration::from_millis(10)) {}
            return Err(ApiError::DownloadStopped);
        }

        let state = self.state.lock();
        let remote = state.remote.get(api_path).ok_or(ApiError::ItemNotFound)?;
        let start = (offset as usize).min(remote.len());
        let end = (start + size as usize).min(remote.len());
        data.clear();
        data.extend_from_slice(&remote[start..end]);
        Ok(())
    }

    fn upload_file(&self, api_path: &str, source_path: &str, stop: &StopToken) -> ApiResult<()> {
        let (block, failure) = {
            let mut state = self.state.lock();
            state
                .upload_log
                .push((api_path.to_owned(), source_path.to_owned()));
            let failure = if state.fail_upload.is_empty() {
                None
            } else {
                Some(state.fail_upload.remove(0))
            };
            (state.block_upload, failure)
        };
        if block {
            while !stop.wait_for(Duration::from_millis(10)) {}
            return Err(ApiError::UploadStopped);
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let contents = std::fs::read(source_path).unwrap_or_default();
        self.state
            .lock()
            .remote
            .insert(api_path.to_owned(), contents);
        Ok(())
    }

    fn create_file(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()> {
        {
            let state = self.state.lock();
            if state.items.contains_key(api_path) {
                return Err(ApiError::ItemExists);
            }
        }
        let source = meta.get(META_SOURCE).cloned().unwrap_or_default();
        self.add_file(api_path, Vec::new(), &source);
        self.set_item_meta_map(api_path, meta)
    }

    fn create_directory(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()> {
        let mut state = self.state.lock();
        if state.items.contains_key(api_path) {
            return Err(ApiError::DirectoryExists);
        }
        state.items.insert(
            api_path.to_owned(),
            FilesystemItem {
                api_path: api_path.to_owned(),
                api_parent: cachefs::api_path::get_parent_api_path(api_path),
                directory: true,
                size: 0,
                source_path: String::new(),
            },
        );
        state.meta.insert(api_path.to_owned(), meta.clone());
        Ok(())
    }

    fn remove_file(&self, api_path: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        state.items.remove(api_path).ok_or(ApiError::ItemNotFound)?;
        state.meta.remove(api_path);
        state.remote.remove(api_path);
        Ok(())
    }

    fn remove_directory(&self, api_path: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        let is_parent = state
            .items
            .values()
            .any(|item| item.api_parent == api_path && item.api_path != api_path);
        if is_parent {
            return Err(ApiError::DirectoryNotEmpty);
        }
        state
            .items
            .remove(api_path)
            .ok_or(ApiError::DirectoryNotFound)?;
        state.meta.remove(api_path);
        Ok(())
    }

    fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>> {
        let state = self.state.lock();
        Ok(state
            .items
            .values()
            .filter(|item| item.api_parent == api_path && item.api_path != "/")
            .map(|item| DirectoryItem {
                api_path: item.api_path.clone(),
                api_parent: item.api_parent.clone(),
                directory: item.directory,
                size: item.size,
                meta: state.meta.get(&item.api_path).cloned().unwrap_or_default(),
            })
            .collect())
    }

    fn get_api_path_from_source(&self, source_path: &str) -> ApiResult<String> {
        let state = self.state.lock();
        state
            .items
            .values()
            .find(|item| item.source_path == source_path)
            .map(|item| item.api_path.clone())
            .ok_or(ApiError::ItemNotFound)
    }

    fn is_direct_only(&self) -> bool {
        self.state.lock().direct_only
    }
}

/// Subscribes to every event and lets tests assert on arrival order.
pub struct EventCapture {
    rx: Receiver<Event>,
}

impl EventCapture {
    pub fn new(bus: &EventBus) -> Self {
        Self {
            rx: bus.subscribe(EventLevel::Trace),
        }
    }

    /// Wait up to five seconds for an event of `kind`, discarding others.
    pub fn wait_for(&self, kind: EventKind) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for {}", kind.name()));
            match self.rx.recv_timeout(remaining) {
                Ok(event) if event.kind == kind => return event,
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for {}", kind.name()),
            }
        }
    }

    /// Assert no event of `kind` shows up within `window`.
    pub fn expect_none(&self, kind: EventKind, window: Duration) {
        let deadline = Instant::now() + window;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            match self.rx.recv_timeout(remaining) {
                Ok(event) if event.kind == kind => {
                    panic!("unexpected {} event", kind.name())
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

pub fn started_bus() -> Arc<EventBus> {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = EventBus::new();
    bus.start();
    bus
}

/// Deterministic pseudo-random contents sized `len`.
pub fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|idx| (idx * 31 % 251) as u8).collect()
}
