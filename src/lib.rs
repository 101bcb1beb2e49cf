//! Open-file cache and I/O pipeline for remotely mounted object stores.
//!
//! A mount shim (FUSE, WinFsp) translates kernel callbacks into operations
//! on the [`OpenFileTable`]; a [`Provider`] adapter translates the other
//! side into a concrete object store. Everything in between is this crate:
//! per-file state machines that materialize remote objects chunk by chunk
//! into sparse local files, serve reads and writes against partially
//! materialized data, queue uploads of modified files, persist enough state
//! to resume after a restart, and evict idle complete files to reclaim
//! cache space.
//!
//! The pieces compose explicitly rather than through globals:
//!
//! ```no_run
//! use std::sync::Arc;
//! use cachefs::{
//!     AppConfig, Eviction, EvictionOptions, EventBus, FileMgrDb, OpenFileTable, Provider,
//!     TableOptions, UploadManager,
//! };
//! # fn provider() -> Arc<dyn Provider> { unimplemented!() }
//!
//! # fn main() -> Result<(), cachefs::ApiError> {
//! let config = AppConfig::load("/var/lib/cachefs")?;
//! let events = EventBus::new();
//! events.start();
//!
//! let provider: Arc<dyn Provider> = provider();
//! let db = Arc::new(FileMgrDb::new(&config.db_directory())?);
//! let uploads = UploadManager::new(
//!     db,
//!     Arc::clone(&provider),
//!     Arc::clone(&events),
//!     config.retry_read_count(),
//! );
//! uploads.start(config.max_upload_count());
//!
//! let table = OpenFileTable::new(
//!     Arc::clone(&provider),
//!     Arc::clone(&uploads),
//!     Arc::clone(&events),
//!     TableOptions::from_config(&config),
//! );
//! table.start();
//!
//! let eviction = Eviction::new(
//!     Arc::clone(&table),
//!     provider,
//!     Arc::clone(&events),
//!     EvictionOptions::from_config(&config),
//! );
//! eviction.start();
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms, unreachable_pub)]

pub mod api_path;
mod bit_set;
mod config;
mod db;
mod error;
mod events;
mod file;
mod lock;
mod provider;
mod stop;
mod types;

pub use crate::bit_set::BitSet;
pub use crate::config::AppConfig;
pub use crate::db::{FileData, FileDb, FileMgrDb, IV_SIZE, MetaDb, ResumeEntry, UploadEntry};
pub use crate::error::{ApiError, ApiResult};
pub use crate::events::{Event, EventBus, EventKind, EventLevel};
pub use crate::file::{
    CompletionHandler, Eviction, EvictionOptions, OpenFile, OpenFileConfig, OpenFileTable,
    RingBufferOpenFile, SourceFile, TableOptions, UploadManager, UploadStore, WritableOpenFile,
};
pub use crate::lock::{LockFile, LockResult, MountState};
pub use crate::provider::Provider;
pub use crate::stop::{StopSource, StopToken};
pub use crate::types::{
    DirectoryItem, DownloadType, ExitCode, FileHandle, FileMeta, FilesystemItem, HandleSource,
    OpenFlags,
};
pub use crate::types::{
    META_ACCESSED, META_ATTRIBUTES, META_BACKUP, META_CHANGED, META_CREATION, META_DIRECTORY,
    META_GID, META_KEY, META_MODE, META_MODIFIED, META_OSXFLAGS, META_PINNED, META_SIZE,
    META_SOURCE, META_UID, META_USED_NAMES, META_WRITTEN,
};
