//! The open-file cache: per-path state machines, the table that owns them,
//! the upload worker pool and the eviction loop.

mod eviction;
mod open_file;
mod ring_buffer;
mod source_file;
mod table;
mod upload;

pub use eviction::{Eviction, EvictionOptions};
pub use open_file::{OpenFileConfig, WritableOpenFile};
pub use ring_buffer::RingBufferOpenFile;
pub use source_file::SourceFile;
pub use table::{OpenFileTable, TableOptions};
pub use upload::{CompletionHandler, UploadManager};

use std::time::Instant;

use crate::bit_set::BitSet;
use crate::error::{ApiError, ApiResult};
use crate::types::{FileHandle, FilesystemItem, OpenFlags};

/// Common contract of every open-file implementation.
///
/// The table stores these behind `Arc<dyn OpenFile>`; mount threads,
/// the sweeper, the upload workers and the eviction loop all call in
/// concurrently. Implementations serialize internally with a per-file lock.
pub trait OpenFile: Send + Sync {
    /// Insert a handle. Fails with the latched terminal error, if any.
    fn add(&self, handle: FileHandle, flags: OpenFlags) -> ApiResult<()>;

    /// Drop a handle. Removing the last handle of a modified file queues
    /// the upload (complete) or persists the resume record (incomplete)
    /// before returning.
    fn remove(&self, handle: FileHandle);

    /// Read exactly `min(size, file_size - offset)` bytes, blocking until
    /// every covered chunk is materialized.
    fn read(&self, size: u64, offset: u64) -> ApiResult<Vec<u8>>;

    /// Write all of `data` at `offset`, extending the file as needed.
    fn write(&self, offset: u64, data: &[u8]) -> ApiResult<usize>;

    /// Grow or shrink to `size`.
    fn resize(&self, size: u64) -> ApiResult<()>;

    /// Tear down: cancel downloads, persist what must survive, flush and
    /// drop the on-disk handle. Returns the terminal error latch.
    fn close(&self) -> ApiError;

    /// Whether the table may destroy this entry right now.
    fn can_close(&self) -> bool;

    /// Every chunk is materialized locally.
    fn is_complete(&self) -> bool;

    fn is_directory(&self) -> bool;

    fn is_modified(&self) -> bool;

    /// Whether `write`/`resize` can ever succeed on this implementation.
    fn is_write_supported(&self) -> bool;

    fn get_api_path(&self) -> String;

    /// Terminal error of the most recent download attempt; `Success` until
    /// proven otherwise.
    fn get_api_error(&self) -> ApiError;

    fn get_chunk_size(&self) -> u64;

    fn get_file_size(&self) -> u64;

    fn get_source_path(&self) -> String;

    fn get_filesystem_item(&self) -> FilesystemItem;

    fn get_open_file_count(&self) -> usize;

    fn get_handles(&self) -> Vec<FileHandle>;

    fn get_open_flags(&self, handle: FileHandle) -> Option<OpenFlags>;

    fn get_read_state(&self) -> BitSet;

    fn get_read_state_for(&self, chunk: u64) -> bool;

    fn get_last_access(&self) -> Instant;

    /// A download thread (foreground, read-ahead or filler) is running.
    fn is_download_active(&self) -> bool;

    /// Upload completed; the file is clean again and may time out of the
    /// table. No-op for read-only implementations.
    fn set_uploaded(&self) {}

    /// Restart the background fill of a restored, partially downloaded
    /// file. No-op for read-only implementations.
    fn resume_download(&self) {}
}

/// Upload-manager capability consumed by open files.
///
/// Passed by reference at construction instead of letting files and the
/// manager own each other.
pub trait UploadStore: Send + Sync {
    /// Append the file to the pending-upload queue.
    fn queue_upload(&self, file: &dyn OpenFile);

    /// Remove the path from pending and active, cancelling an in-flight
    /// upload.
    fn remove_upload(&self, api_path: &str);

    /// Persist the file's download progress for crash recovery.
    fn store_resume(&self, file: &dyn OpenFile);

    /// Drop the resume record for `api_path`.
    fn remove_resume(&self, api_path: &str, source_path: &str);
}
