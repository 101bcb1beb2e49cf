//! Upload manager lifecycle: success, cancellation, stop, retries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cachefs::{
    ApiError, DownloadType, EventBus, EventKind, FileMgrDb, OpenFile, OpenFileConfig, Provider,
    UploadManager, UploadStore, WritableOpenFile,
};
use common::{CHUNK, EventCapture, MockProvider, pattern_bytes, started_bus};

struct Fixture {
    dir: TempDir,
    provider: Arc<MockProvider>,
    events: Arc<EventBus>,
    db: Arc<FileMgrDb>,
    uploads: Arc<UploadManager>,
}

impl Fixture {
    fn new(retry_limit: u16) -> Self {
        let dir = TempDir::new().unwrap();
        let provider = MockProvider::new();
        let events = started_bus();
        let db = Arc::new(FileMgrDb::new(&dir.path().join("db")).unwrap());
        let uploads = UploadManager::new(
            Arc::clone(&db),
            Arc::clone(&provider) as Arc<dyn Provider>,
            Arc::clone(&events),
            retry_limit,
        );
        Self {
            dir,
            provider,
            events,
            db,
            uploads,
        }
    }

    /// A closed, fully written local file ready to upload.
    fn local_file(&self, api_path: &str, contents: &[u8]) -> Arc<WritableOpenFile> {
        self.provider.add_file(api_path, Vec::new(), "");
        let config = OpenFileConfig {
            chunk_size: CHUNK,
            download_type: DownloadType::Direct,
            read_ahead_count: 0,
            retry_read_count: 2,
            cache_directory: self.dir.path().join("cache"),
        };
        let fsi = self.provider.get_filesystem_item(api_path, false).unwrap();
        let file = WritableOpenFile::new(
            &config,
            fsi,
            Arc::clone(&self.provider) as Arc<dyn Provider>,
            Arc::clone(&self.uploads) as Arc<dyn UploadStore>,
            Arc::clone(&self.events),
        )
        .unwrap();
        file.write(0, contents).unwrap();
        file
    }
}

#[test]
fn upload_completes_and_round_trips() {
    let fx = Fixture::new(2);
    let capture = EventCapture::new(&fx.events);
    let contents = pattern_bytes(CHUNK as usize + 7);
    let file = fx.local_file("/up.txt", &contents);

    fx.uploads.start(2);
    fx.uploads.queue_upload(file.as_ref());
    capture.wait_for(EventKind::FileUploadQueued);
    capture.wait_for(EventKind::FileUploadStarted);
    let completed = capture.wait_for(EventKind::FileUploadCompleted);
    assert_eq!(Some("success"), completed.field("result"));
    assert_eq!(Some("0"), completed.field("cancelled"));

    assert_eq!(Some(contents), fx.provider.remote_contents("/up.txt"));
    assert!(fx.db.get_upload_active_list().unwrap().is_empty());
    assert!(fx.db.get_resume("/up.txt").unwrap().is_none());
    fx.uploads.stop();
}

#[test]
fn remove_upload_cancels_an_active_upload() {
    let fx = Fixture::new(2);
    let capture = EventCapture::new(&fx.events);
    let file = fx.local_file("/cancel.txt", &[1, 2, 3]);
    fx.provider.set_block_upload(true);

    fx.uploads.start(1);
    fx.uploads.queue_upload(file.as_ref());
    capture.wait_for(EventKind::FileUploadStarted);

    fx.uploads.remove_upload("/cancel.txt");
    let completed = capture.wait_for(EventKind::FileUploadCompleted);
    assert_eq!(Some("upload_stopped"), completed.field("result"));
    assert_eq!(Some("1"), completed.field("cancelled"));

    // Cancellation keeps the resume record so a later queue retries.
    assert!(fx.db.get_resume("/cancel.txt").unwrap().is_some());
    fx.uploads.stop();
}

#[test]
fn shutdown_stops_an_active_upload_without_cancelled_flag() {
    let fx = Fixture::new(2);
    let capture = EventCapture::new(&fx.events);
    let file = fx.local_file("/stop.txt", &[1, 2, 3]);
    fx.provider.set_block_upload(true);

    fx.uploads.start(1);
    fx.uploads.queue_upload(file.as_ref());
    capture.wait_for(EventKind::FileUploadStarted);

    fx.uploads.stop();
    let completed = capture.wait_for(EventKind::FileUploadCompleted);
    assert_eq!(Some("upload_stopped"), completed.field("result"));
    assert_eq!(Some("0"), completed.field("cancelled"));
    assert!(fx.db.get_resume("/stop.txt").unwrap().is_some());
}

#[test]
fn retryable_failures_are_retried_until_success() {
    let fx = Fixture::new(3);
    let capture = EventCapture::new(&fx.events);
    let contents = [9u8; 16];
    let file = fx.local_file("/retry.txt", &contents);
    fx.provider.push_upload_failure(ApiError::CommError);

    fx.uploads.start(1);
    fx.uploads.queue_upload(file.as_ref());

    capture.wait_for(EventKind::FileUploadRetry);
    let completed = capture.wait_for(EventKind::FileUploadCompleted);
    assert_eq!(Some("success"), completed.field("result"));
    assert_eq!(Some(contents.to_vec()), fx.provider.remote_contents("/retry.txt"));
    fx.uploads.stop();
}

#[test]
fn retries_are_bounded_by_the_configured_limit() {
    let fx = Fixture::new(2);
    let capture = EventCapture::new(&fx.events);
    let file = fx.local_file("/fail.txt", &[5u8; 8]);
    for _ in 0..10 {
        fx.provider.push_upload_failure(ApiError::CommError);
    }

    fx.uploads.start(1);
    fx.uploads.queue_upload(file.as_ref());

    capture.wait_for(EventKind::FileUploadRetry);
    let failed = capture.wait_for(EventKind::FileUploadFailed);
    assert_eq!(Some("comm_error"), failed.field("result"));
    // Terminal failure keeps the resume record but drops active state.
    assert!(fx.db.get_resume("/fail.txt").unwrap().is_some());
    assert!(fx.db.get_upload_active_list().unwrap().is_empty());
    fx.uploads.stop();
}

#[test]
fn terminal_failures_do_not_retry() {
    let fx = Fixture::new(5);
    let capture = EventCapture::new(&fx.events);
    let file = fx.local_file("/denied.txt", &[5u8; 8]);
    fx.provider.push_upload_failure(ApiError::AccessDenied);

    fx.uploads.start(1);
    fx.uploads.queue_upload(file.as_ref());

    let failed = capture.wait_for(EventKind::FileUploadFailed);
    assert_eq!(Some("access_denied"), failed.field("result"));
    capture.expect_none(EventKind::FileUploadRetry, Duration::from_millis(200));
    fx.uploads.stop();
}

#[test]
fn interrupted_actives_requeue_ahead_of_backlog_on_start() {
    let fx = Fixture::new(2);
    // Simulate a crash: one upload was active, one still pending.
    fx.db.add_upload("/was-active.txt", "/src/a").unwrap();
    fx.db.add_upload("/backlog.txt", "/src/b").unwrap();
    fx.db.activate_next_upload().unwrap();

    fx.provider.add_file("/was-active.txt", Vec::new(), "");
    fx.provider.add_file("/backlog.txt", Vec::new(), "");

    let capture = EventCapture::new(&fx.events);
    fx.uploads.start(1);

    let first = capture.wait_for(EventKind::FileUploadStarted);
    assert_eq!(Some("/was-active.txt"), first.field("api_path"));
    let second = capture.wait_for(EventKind::FileUploadStarted);
    assert_eq!(Some("/backlog.txt"), second.field("api_path"));
    fx.uploads.stop();
}

#[test]
fn is_processing_tracks_every_stage() {
    let fx = Fixture::new(2);
    let file = fx.local_file("/proc.txt", &[1]);
    assert!(fx.uploads.is_processing("/proc.txt")); // resume record from the write

    fx.uploads.queue_upload(file.as_ref());
    assert!(fx.uploads.is_processing("/proc.txt"));

    fx.uploads.remove_upload("/proc.txt");
    fx.uploads.remove_resume_record("/proc.txt");
    assert!(!fx.uploads.is_processing("/proc.txt"));
}
