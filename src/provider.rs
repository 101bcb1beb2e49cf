//! The capability surface the cache core consumes from a storage backend.
//!
//! Concrete adapters (S3, renterd, a remote peer, a local encrypted
//! directory) live outside this crate; everything here is expressed against
//! [`Provider`] so the core can be driven by any of them, or by the mock
//! used in the integration tests.

use crate::error::ApiResult;
use crate::stop::StopToken;
use crate::types::{DirectoryItem, FileMeta, FilesystemItem};

/// Storage backend capability set. Every method may be called concurrently
/// from mount threads, download threads and upload workers.
pub trait Provider: Send + Sync {
    /// Resolve an api path to its denormalized item view.
    ///
    /// Returns `item_not_found` / `directory_not_found` when the path does
    /// not exist with the requested kind.
    fn get_filesystem_item(&self, api_path: &str, directory: bool) -> ApiResult<FilesystemItem>;

    /// Full metadata map for an item.
    fn get_item_meta(&self, api_path: &str) -> ApiResult<FileMeta>;

    /// A single metadata value.
    fn get_item_meta_value(&self, api_path: &str, key: &str) -> ApiResult<String>;

    /// Set a single metadata value.
    fn set_item_meta(&self, api_path: &str, key: &str, value: &str) -> ApiResult<()>;

    /// Merge a metadata map into an item.
    fn set_item_meta_map(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()>;

    /// Read exactly `size` bytes at `offset` into `data`.
    ///
    /// Implementations must poll `stop` and bail with `download_stopped`
    /// when it fires. A successful return with fewer than `size` bytes is a
    /// protocol violation the caller treats as an error.
    fn read_file_bytes(
        &self,
        api_path: &str,
        size: u64,
        offset: u64,
        data: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()>;

    /// Upload the local file at `source_path` as the new contents of
    /// `api_path`. Must poll `stop` and bail with `upload_stopped`.
    fn upload_file(&self, api_path: &str, source_path: &str, stop: &StopToken) -> ApiResult<()>;

    fn create_file(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()>;

    fn create_directory(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()>;

    fn remove_file(&self, api_path: &str) -> ApiResult<()>;

    fn remove_directory(&self, api_path: &str) -> ApiResult<()>;

    /// Whether [`Provider::rename_file`] is usable.
    fn is_rename_supported(&self) -> bool {
        false
    }

    fn rename_file(&self, _from_api_path: &str, _to_api_path: &str) -> ApiResult<()> {
        Err(crate::error::ApiError::NotImplemented)
    }

    fn get_directory_items(&self, api_path: &str) -> ApiResult<Vec<DirectoryItem>>;

    /// Inverse lookup from a cache source file to the api path that owns
    /// it. Eviction uses this to map on-disk files back to items.
    fn get_api_path_from_source(&self, source_path: &str) -> ApiResult<String>;

    /// Direct-only providers forbid local caching: the open-file table must
    /// not materialize source files, must not evict, and every read turns
    /// into a provider call.
    fn is_direct_only(&self) -> bool;
}
