//! RocksDB-backed upload queues and resume records.
//!
//! Column families:
//! - default: api_path → resume record JSON
//!   `{chunk_size, read_state: hex, source_path}`
//! - `upload`: `zero_padded_id(20) + '|' + api_path` → source_path; key
//!   iteration order is FIFO order
//! - `upload_active`: api_path → source_path
//!
//! Pending and active are disjoint by construction: a pending entry is
//! activated by a single transaction that deletes it from `upload` and
//! inserts it into `upload_active`.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use log::error;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, TransactionDB,
    TransactionDBOptions,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

const FAMILY_UPLOAD: &str = "upload";
const FAMILY_UPLOAD_ACTIVE: &str = "upload_active";

/// One pending or active upload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadEntry {
    pub api_path: String,
    pub source_path: String,
}

/// Persisted snapshot of a partially downloaded file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResumeEntry {
    #[serde(skip)]
    pub api_path: String,
    pub chunk_size: u64,
    /// Little-endian hex rendering of the read-state bitset.
    pub read_state: String,
    pub source_path: String,
}

pub struct FileMgrDb {
    db: TransactionDB,
    next_upload_id: AtomicU64,
}

impl FileMgrDb {
    /// Open (creating if needed) the `file_mgr` database inside
    /// `db_directory`. The upload id counter resumes past the largest
    /// persisted key.
    pub fn new(db_directory: &Path) -> ApiResult<Self> {
        fs::create_dir_all(db_directory)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let families = [FAMILY_UPLOAD_ACTIVE, FAMILY_UPLOAD]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = TransactionDB::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            db_directory.join("file_mgr"),
            families,
        )
        .map_err(db_error)?;

        let this = Self {
            db,
            next_upload_id: AtomicU64::new(0),
        };
        let max_id = this
            .upload_entries()?
            .iter()
            .map(|(id, _)| *id)
            .max()
            .unwrap_or(0);
        this.next_upload_id.store(max_id, Ordering::Relaxed);
        Ok(this)
    }

    /// Append to the pending queue.
    pub fn add_upload(&self, api_path: &str, source_path: &str) -> ApiResult<()> {
        let id = self.next_upload_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.db
            .put_cf(
                self.family(FAMILY_UPLOAD),
                upload_key(id, api_path),
                source_path,
            )
            .map_err(db_error)
    }

    /// Pending entries in FIFO order.
    pub fn get_upload_list(&self) -> ApiResult<Vec<UploadEntry>> {
        Ok(self
            .upload_entries()?
            .into_iter()
            .map(|(_, entry)| entry)
            .collect())
    }

    pub fn get_upload(&self, api_path: &str) -> ApiResult<Option<UploadEntry>> {
        Ok(self
            .upload_entries()?
            .into_iter()
            .map(|(_, entry)| entry)
            .find(|entry| entry.api_path == api_path))
    }

    /// Atomically move the queue head to the active family. Returns `None`
    /// when the queue is empty.
    pub fn activate_next_upload(&self) -> ApiResult<Option<UploadEntry>> {
        let Some((id, entry)) = self.upload_entries()?.into_iter().next() else {
            return Ok(None);
        };

        let txn = self.db.transaction();
        let result = (|| -> Result<(), rocksdb::Error> {
            txn.delete_cf(self.family(FAMILY_UPLOAD), upload_key(id, &entry.api_path))?;
            txn.put_cf(
                self.family(FAMILY_UPLOAD_ACTIVE),
                &entry.api_path,
                &entry.source_path,
            )?;
            Ok(())
        })()
        .map_err(|err| {
            error!("upload db activation failed for {}: {err}", entry.api_path);
            ApiError::Error
        });

        match result {
            Ok(()) => {
                txn.commit().map_err(db_error)?;
                Ok(Some(entry))
            }
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    /// Drop an api path from pending and active. Idempotent.
    pub fn remove_upload(&self, api_path: &str) -> ApiResult<()> {
        let keys: Vec<_> = self
            .upload_entries()?
            .into_iter()
            .filter(|(_, entry)| entry.api_path == api_path)
            .map(|(id, entry)| upload_key(id, &entry.api_path))
            .collect();

        let txn = self.db.transaction();
        let result = (|| -> Result<(), rocksdb::Error> {
            for key in &keys {
                txn.delete_cf(self.family(FAMILY_UPLOAD), key)?;
            }
            txn.delete_cf(self.family(FAMILY_UPLOAD_ACTIVE), api_path)?;
            Ok(())
        })()
        .map_err(|err| {
            error!("upload db removal failed for {api_path}: {err}");
            ApiError::Error
        });

        match result {
            Ok(()) => txn.commit().map_err(db_error),
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    pub fn remove_upload_active(&self, api_path: &str) -> ApiResult<()> {
        self.db
            .delete_cf(self.family(FAMILY_UPLOAD_ACTIVE), api_path)
            .map_err(db_error)
    }

    pub fn get_upload_active_list(&self) -> ApiResult<Vec<UploadEntry>> {
        let mut list = Vec::new();
        for item in self
            .db
            .iterator_cf(self.family(FAMILY_UPLOAD_ACTIVE), IteratorMode::Start)
        {
            let (key, value) = item.map_err(db_error)?;
            list.push(UploadEntry {
                api_path: String::from_utf8_lossy(&key).into_owned(),
                source_path: String::from_utf8_lossy(&value).into_owned(),
            });
        }
        Ok(list)
    }

    /// Startup recovery: interrupted active uploads rejoin the queue ahead
    /// of the persisted backlog. The queue is renumbered from 1, preserving
    /// FIFO order within each group.
    pub fn requeue_active_uploads(&self) -> ApiResult<Vec<UploadEntry>> {
        let actives = self.get_upload_active_list()?;
        if actives.is_empty() {
            return Ok(Vec::new());
        }
        let pending = self.upload_entries()?;

        let txn = self.db.transaction();
        let result = (|| -> Result<(), rocksdb::Error> {
            for entry in &actives {
                txn.delete_cf(self.family(FAMILY_UPLOAD_ACTIVE), &entry.api_path)?;
            }
            for (id, entry) in &pending {
                txn.delete_cf(self.family(FAMILY_UPLOAD), upload_key(*id, &entry.api_path))?;
            }
            let mut id = 0;
            for entry in actives.iter().chain(pending.iter().map(|(_, entry)| entry)) {
                id += 1;
                txn.put_cf(
                    self.family(FAMILY_UPLOAD),
                    upload_key(id, &entry.api_path),
                    &entry.source_path,
                )?;
            }
            Ok(())
        })()
        .map_err(|err| {
            error!("upload db requeue failed: {err}");
            ApiError::Error
        });

        match result {
            Ok(()) => {
                txn.commit().map_err(db_error)?;
                self.next_upload_id.store(
                    (actives.len() + pending.len()) as u64,
                    Ordering::Relaxed,
                );
                Ok(actives)
            }
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    /// Insert or replace the resume record for an api path.
    pub fn add_resume(&self, entry: &ResumeEntry) -> ApiResult<()> {
        self.db
            .put_cf(
                self.resume_family(),
                &entry.api_path,
                serde_json::to_string(entry).unwrap_or_default(),
            )
            .map_err(db_error)
    }

    pub fn remove_resume(&self, api_path: &str) -> ApiResult<()> {
        self.db
            .delete_cf(self.resume_family(), api_path)
            .map_err(db_error)
    }

    pub fn get_resume(&self, api_path: &str) -> ApiResult<Option<ResumeEntry>> {
        let Some(value) = self
            .db
            .get_cf(self.resume_family(), api_path)
            .map_err(db_error)?
        else {
            return Ok(None);
        };
        Ok(parse_resume(api_path, &value))
    }

    pub fn get_resume_list(&self) -> ApiResult<Vec<ResumeEntry>> {
        let mut list = Vec::new();
        for item in self.db.iterator_cf(self.resume_family(), IteratorMode::Start) {
            let (key, value) = item.map_err(db_error)?;
            let api_path = String::from_utf8_lossy(&key).into_owned();
            if let Some(entry) = parse_resume(&api_path, &value) {
                list.push(entry);
            }
        }
        Ok(list)
    }

    /// Move a resume record to a renamed api path. Missing records are fine.
    pub fn rename_resume(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()> {
        let Some(mut entry) = self.get_resume(from_api_path)? else {
            return Ok(());
        };
        entry.api_path = to_api_path.to_owned();

        let txn = self.db.transaction();
        let result = (|| -> Result<(), rocksdb::Error> {
            txn.delete_cf(self.resume_family(), from_api_path)?;
            txn.put_cf(
                self.resume_family(),
                to_api_path,
                serde_json::to_string(&entry).unwrap_or_default(),
            )?;
            Ok(())
        })()
        .map_err(|err| {
            error!("resume rename failed {from_api_path} -> {to_api_path}: {err}");
            ApiError::Error
        });

        match result {
            Ok(()) => txn.commit().map_err(db_error),
            Err(err) => {
                let _ = txn.rollback();
                Err(err)
            }
        }
    }

    // Pending entries with their numeric ids, in key (FIFO) order.
    fn upload_entries(&self) -> ApiResult<Vec<(u64, UploadEntry)>> {
        let mut list = Vec::new();
        for item in self
            .db
            .iterator_cf(self.family(FAMILY_UPLOAD), IteratorMode::Start)
        {
            let (key, value) = item.map_err(db_error)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let Some((id, api_path)) = key.split_once('|') else {
                continue;
            };
            let Ok(id) = id.parse::<u64>() else {
                continue;
            };
            list.push((
                id,
                UploadEntry {
                    api_path: api_path.to_owned(),
                    source_path: String::from_utf8_lossy(&value).into_owned(),
                },
            ));
        }
        Ok(list)
    }

    // Families are created in new(); a missing handle is unreachable.
    fn family(&self, name: &str) -> &ColumnFamily {
        self.db
            .cf_handle(name)
            .expect("column family created at open")
    }

    fn resume_family(&self) -> &ColumnFamily {
        self.db
            .cf_handle(rocksdb::DEFAULT_COLUMN_FAMILY_NAME)
            .expect("default column family always exists")
    }
}

fn upload_key(id: u64, api_path: &str) -> String {
    format!("{id:020}|{api_path}")
}

fn parse_resume(api_path: &str, value: &[u8]) -> Option<ResumeEntry> {
    match serde_json::from_slice::<ResumeEntry>(value) {
        Ok(mut entry) => {
            entry.api_path = api_path.to_owned();
            Some(entry)
        }
        Err(err) => {
            error!("corrupt resume record for {api_path}: {err}");
            None
        }
    }
}

fn db_error(err: rocksdb::Error) -> ApiError {
    error!("upload db failure: {err}");
    ApiError::Error
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, FileMgrDb) {
        let dir = TempDir::new().unwrap();
        let db = FileMgrDb::new(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn uploads_activate_in_fifo_order() {
        let (_dir, db) = open_db();
        db.add_upload("/a", "/cache/a").unwrap();
        db.add_upload("/b", "/cache/b").unwrap();
        db.add_upload("/c", "/cache/c").unwrap();

        let first = db.activate_next_upload().unwrap().unwrap();
        assert_eq!("/a", first.api_path);
        // Activated entries leave pending, so active and pending stay
        // disjoint.
        assert!(db.get_upload("/a").unwrap().is_none());
        assert_eq!(1, db.get_upload_active_list().unwrap().len());

        let second = db.activate_next_upload().unwrap().unwrap();
        assert_eq!("/b", second.api_path);
    }

    #[test]
    fn remove_upload_is_idempotent() {
        let (_dir, db) = open_db();
        db.add_upload("/a", "/cache/a").unwrap();
        db.remove_upload("/a").unwrap();
        db.remove_upload("/a").unwrap();
        assert!(db.get_upload_list().unwrap().is_empty());
    }

    #[test]
    fn api_paths_may_contain_the_key_separator() {
        let (_dir, db) = open_db();
        db.add_upload("/weird|name", "/cache/w").unwrap();
        let entry = db.get_upload("/weird|name").unwrap().unwrap();
        assert_eq!("/weird|name", entry.api_path);
    }

    #[test]
    fn requeue_puts_interrupted_actives_first() {
        let (_dir, db) = open_db();
        db.add_upload("/pending1", "/cache/p1").unwrap();
        db.add_upload("/active1", "/cache/a1").unwrap();
        db.add_upload("/pending2", "/cache/p2").unwrap();
        // Simulate a crash mid-upload: /pending1 and /active1 were taken.
        db.activate_next_upload().unwrap();
        db.activate_next_upload().unwrap();
        db.remove_upload_active("/pending1").unwrap();

        let restored = db.requeue_active_uploads().unwrap();
        assert_eq!(1, restored.len());
        assert_eq!("/active1", restored[0].api_path);

        let order: Vec<_> = db
            .get_upload_list()
            .unwrap()
            .into_iter()
            .map(|entry| entry.api_path)
            .collect();
        assert_eq!(vec!["/active1", "/pending2"], order);
        assert!(db.get_upload_active_list().unwrap().is_empty());
    }

    #[test]
    fn upload_ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = FileMgrDb::new(dir.path()).unwrap();
            db.add_upload("/a", "/cache/a").unwrap();
        }
        let db = FileMgrDb::new(dir.path()).unwrap();
        db.add_upload("/b", "/cache/b").unwrap();

        let order: Vec<_> = db
            .get_upload_list()
            .unwrap()
            .into_iter()
            .map(|entry| entry.api_path)
            .collect();
        assert_eq!(vec!["/a", "/b"], order);
    }

    #[test]
    fn resume_records_store_exactly_one_entry_per_path() {
        let (_dir, db) = open_db();
        let entry = ResumeEntry {
            api_path: "/a".to_owned(),
            chunk_size: 1024,
            read_state: "0f".to_owned(),
            source_path: "/cache/a".to_owned(),
        };
        db.add_resume(&entry).unwrap();
        db.add_resume(&entry).unwrap();

        let list = db.get_resume_list().unwrap();
        assert_eq!(1, list.len());
        assert_eq!(entry, list[0]);
        assert_eq!(Some(entry), db.get_resume("/a").unwrap());

        db.remove_resume("/a").unwrap();
        db.remove_resume("/a").unwrap();
        assert!(db.get_resume_list().unwrap().is_empty());
    }

    #[test]
    fn resume_rename() {
        let (_dir, db) = open_db();
        db.add_resume(&ResumeEntry {
            api_path: "/old".to_owned(),
            chunk_size: 512,
            read_state: "ff".to_owned(),
            source_path: "/cache/x".to_owned(),
        })
        .unwrap();

        db.rename_resume("/old", "/new").unwrap();
        assert!(db.get_resume("/old").unwrap().is_none());
        let entry = db.get_resume("/new").unwrap().unwrap();
        assert_eq!("/new", entry.api_path);
        assert_eq!("ff", entry.read_state);

        // Renaming a path without a record is a no-op.
        db.rename_resume("/missing", "/other").unwrap();
    }
}
