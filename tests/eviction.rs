//! Eviction loop: usage trigger, candidate ordering, orphan cleanup.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cachefs::{
    DownloadType, EventBus, EventKind, Eviction, EvictionOptions, FileMgrDb, OpenFile,
    OpenFileTable, OpenFlags, Provider, TableOptions, UploadManager, META_SOURCE,
};
use common::{CHUNK, EventCapture, MockProvider, pattern_bytes, started_bus};

struct Fixture {
    dir: TempDir,
    provider: Arc<MockProvider>,
    events: Arc<EventBus>,
    table: Arc<OpenFileTable>,
    eviction: Arc<Eviction>,
}

impl Fixture {
    fn new(max_cache_size: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::new();
        let events = started_bus();
        let db = Arc::new(FileMgrDb::new(&dir.path().join("db")).unwrap());
        let uploads = UploadManager::new(
            Arc::clone(&db),
            Arc::clone(&provider) as Arc<dyn Provider>,
            Arc::clone(&events),
            2,
        );
        let table = OpenFileTable::new(
            Arc::clone(&provider) as Arc<dyn Provider>,
            uploads,
            Arc::clone(&events),
            TableOptions {
                cache_directory: dir.path().join("cache"),
                ring_buffer_directory: dir.path().join("ring_buffer"),
                chunk_size: CHUNK,
                preferred_download_type: DownloadType::Direct,
                read_ahead_count: 0,
                retry_read_count: 2,
                ring_buffer_size: 8,
                item_timeout: Duration::from_secs(3600),
                sweep_interval: Duration::from_secs(3600),
                enable_download_timeout: true,
            },
        );
        let eviction = Eviction::new(
            Arc::clone(&table),
            Arc::clone(&provider) as Arc<dyn Provider>,
            Arc::clone(&events),
            EvictionOptions {
                cache_directory: dir.path().join("cache"),
                enable_max_cache_size: true,
                max_cache_size_bytes: max_cache_size,
                check_interval: Duration::from_secs(3600),
                uses_accessed_time: false,
            },
        );
        Self {
            dir,
            provider,
            events,
            table,
            eviction,
        }
    }

    /// Materialize a remote file fully into the cache, then close it.
    fn cache_file(&self, api_path: &str, len: usize) -> String {
        self.provider.add_file(api_path, pattern_bytes(len), "");
        let (handle, file) = self.table.open(api_path, false, OpenFlags::READ).unwrap();
        file.read(len as u64, 0).unwrap();
        let source = file.get_source_path();
        self.table.close(handle).unwrap();
        source
    }
}

#[test]
fn scan_below_the_limit_evicts_nothing() {
    let fx = Fixture::new(10 * CHUNK);
    let source = fx.cache_file("/a.bin", CHUNK as usize);

    fx.eviction.check_items_thread();
    assert!(std::path::Path::new(&source).exists());
}

#[test]
fn scan_over_the_limit_evicts_the_oldest_first() {
    let fx = Fixture::new(3 * CHUNK);
    let old_source = fx.cache_file("/old.bin", 2 * CHUNK as usize);
    std::thread::sleep(Duration::from_millis(30));
    let new_source = fx.cache_file("/new.bin", 2 * CHUNK as usize);
    let capture = EventCapture::new(&fx.events);

    fx.eviction.check_items_thread();

    let event = capture.wait_for(EventKind::FilesystemItemEvicted);
    assert_eq!(Some("/old.bin"), event.field("api_path"));
    assert!(!std::path::Path::new(&old_source).exists());
    // Usage fell under the low-water mark before the newer file.
    assert!(std::path::Path::new(&new_source).exists());
    assert_eq!(
        "",
        fx.provider.get_item_meta_value("/old.bin", META_SOURCE).unwrap()
    );
}

#[test]
fn pinned_files_survive_pressure() {
    let fx = Fixture::new(CHUNK);
    let source = fx.cache_file("/pinned.bin", 2 * CHUNK as usize);
    fx.provider.set_pinned("/pinned.bin", true);

    fx.eviction.check_items_thread();
    assert!(std::path::Path::new(&source).exists());
}

#[test]
fn orphaned_cache_files_are_deleted() {
    let fx = Fixture::new(u64::MAX);
    let cache_dir = fx.dir.path().join("cache");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let orphan = cache_dir.join("11111111-2222-3333-4444-555555555555");
    std::fs::write(&orphan, b"stale").unwrap();
    let capture = EventCapture::new(&fx.events);

    fx.eviction.check_items_thread();

    capture.wait_for(EventKind::OrphanedFileDetected);
    capture.wait_for(EventKind::OrphanedFileDeleted);
    assert!(!orphan.exists());
}

#[test]
fn direct_only_providers_never_evict() {
    let fx = Fixture::new(CHUNK);
    let source = fx.cache_file("/direct.bin", 2 * CHUNK as usize);
    fx.provider.set_direct_only(true);

    fx.eviction.check_items_thread();
    assert!(std::path::Path::new(&source).exists());
}
