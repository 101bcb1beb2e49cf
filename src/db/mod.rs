//! Durable stores backing the cache core.
//!
//! Three databases live under `<data_directory>/db`:
//! `meta.db` (SQLite) maps api paths to item metadata, `file/` (RocksDB)
//! is the bidirectional api-path/source-path index, and `file_mgr/`
//! (RocksDB) holds the upload queues and resume records.

mod file_db;
mod file_mgr_db;
mod meta_db;

pub use file_db::{FileData, FileDb, IV_SIZE};
pub use file_mgr_db::{FileMgrDb, ResumeEntry, UploadEntry};
pub use meta_db::MetaDb;
