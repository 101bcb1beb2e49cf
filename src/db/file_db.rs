//! RocksDB-backed file index.
//!
//! Column families:
//! - `path`: api_path → source_path
//! - `source`: source_path → api_path (inverse of `path`)
//! - `directory`: api_path → source_path, a row exists iff the path is a
//!   directory
//! - `file`: api_path → JSON `{file_size, iv, source_path}` where `iv` is
//!   the per-chunk IV list for encrypt-provider files
//!
//! Every multi-family update runs inside one pessimistic transaction; a
//! failed step rolls the whole write back.

use std::fs;
use std::path::Path;

use log::error;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, TransactionDB,
    TransactionDBOptions,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

const FAMILY_FILE: &str = "file";
const FAMILY_PATH: &str = "path";
const FAMILY_SOURCE: &str = "source";
const FAMILY_DIRECTORY: &str = "directory";

/// Length of the IVs stored per encrypted chunk.
pub const IV_SIZE: usize = 24;

/// Per-file row in the `file` family.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileData {
    #[serde(skip)]
    pub api_path: String,
    pub file_size: u64,
    #[serde(default)]
    pub iv: Vec<[u8; IV_SIZE]>,
    pub source_path: String,
}

pub struct FileDb {
    db: TransactionDB,
}

impl FileDb {
    /// Open (creating if needed) the `file` database inside `db_directory`.
    pub fn new(db_directory: &Path) -> ApiResult<Self> {
        fs::create_dir_all(db_directory)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let families = [FAMILY_FILE, FAMILY_PATH, FAMILY_SOURCE, FAMILY_DIRECTORY]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));
        let db = TransactionDB::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            db_directory.join("file"),
            families,
        )
        .map_err(db_error)?;
        Ok(Self { db })
    }

    /// Insert or update a file row, keeping both directions of the index in
    /// step. A source-path change removes the stale inverse entry.
    pub fn add_or_update_file(&self, data: &FileData) -> ApiResult<()> {
        let txn = self.db.transaction();
        let previous = txn
            .get_cf(self.family(FAMILY_PATH), &data.api_path)
            .map_err(db_error)?;

        let result = (|| -> Result<(), rocksdb::Error> {
            if let Some(old_source) = &previous {
                if old_source.as_slice() != data.source_path.as_bytes() {
                    txn.delete_cf(self.family(FAMILY_SOURCE), old_source)?;
                }
            }
            txn.put_cf(
                self.family(FAMILY_FILE),
                &data.api_path,
                serde_json::to_string(data).unwrap_or_default(),
            )?;
            txn.put_cf(self.family(FAMILY_PATH), &data.api_path, &data.source_path)?;
            txn.put_cf(self.family(FAMILY_SOURCE), &data.source_path, &data.api_path)?;
            Ok(())
        })()
        .map_err(|err| {
            error!("file db update failed for {}: {err}", data.api_path);
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

    pub fn get_file_data(&self, api_path: &str) -> ApiResult<FileData> {
        let value = self
            .db
            .get_cf(self.family(FAMILY_FILE), api_path)
            .map_err(db_error)?
            .ok_or(ApiError::ItemNotFound)?;
        let mut data: FileData = serde_json::from_slice(&value).map_err(|err| {
            error!("corrupt file db row for {api_path}: {err}");
            ApiError::Error
        })?;
        data.api_path = api_path.to_owned();
        Ok(data)
    }

    pub fn add_directory(&self, api_path: &str, source_path: &str) -> ApiResult<()> {
        let txn = self.db.transaction();
        let result = (|| -> Result<(), rocksdb::Error> {
            txn.put_cf(self.family(FAMILY_DIRECTORY), api_path, source_path)?;
            txn.put_cf(self.family(FAMILY_PATH), api_path, source_path)?;
            if !source_path.is_empty() {
                txn.put_cf(self.family(FAMILY_SOURCE), source_path, api_path)?;
            }
            Ok(())
        })()
        .map_err(|err| {
            error!("file db add_directory failed for {api_path}: {err}");
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

    pub fn is_directory(&self, api_path: &str) -> ApiResult<bool> {
        Ok(self
            .db
            .get_cf(self.family(FAMILY_DIRECTORY), api_path)
            .map_err(db_error)?
            .is_some())
    }

    pub fn get_directory_source_path(&self, api_path: &str) -> ApiResult<String> {
        self.db
            .get_cf(self.family(FAMILY_DIRECTORY), api_path)
            .map_err(db_error)?
            .map(|value| String::from_utf8_lossy(&value).into_owned())
            .ok_or(ApiError::DirectoryNotFound)
    }

    pub fn get_directory_api_path_list(&self) -> ApiResult<Vec<String>> {
        let mut list = Vec::new();
        for item in self
            .db
            .iterator_cf(self.family(FAMILY_DIRECTORY), IteratorMode::Start)
        {
            let (key, _) = item.map_err(db_error)?;
            list.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(list)
    }

    /// Forward lookup, files and directories alike.
    pub fn get_source_path(&self, api_path: &str) -> ApiResult<String> {
        self.db
            .get_cf(self.family(FAMILY_PATH), api_path)
            .map_err(db_error)?
            .map(|value| String::from_utf8_lossy(&value).into_owned())
            .ok_or(ApiError::ItemNotFound)
    }

    /// Inverse lookup from a cache file back to its api path.
    pub fn get_api_path(&self, source_path: &str) -> ApiResult<String> {
        self.db
            .get_cf(self.family(FAMILY_SOURCE), source_path)
            .map_err(db_error)?
            .map(|value| String::from_utf8_lossy(&value).into_owned())
            .ok_or(ApiError::ItemNotFound)
    }

    /// Remove an item from every family it appears in.
    pub fn remove_item(&self, api_path: &str) -> ApiResult<()> {
        let txn = self.db.transaction();
        let source = txn
            .get_cf(self.family(FAMILY_PATH), api_path)
            .map_err(db_error)?;

        let result = (|| -> Result<(), rocksdb::Error> {
            if let Some(source) = &source {
                txn.delete_cf(self.family(FAMILY_SOURCE), source)?;
            }
            txn.delete_cf(self.family(FAMILY_FILE), api_path)?;
            txn.delete_cf(self.family(FAMILY_PATH), api_path)?;
            txn.delete_cf(self.family(FAMILY_DIRECTORY), api_path)?;
            Ok(())
        })()
        .map_err(|err| {
            error!("file db remove failed for {api_path}: {err}");
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

    // Families are created in new(); a missing handle is unreachable.
    fn family(&self, name: &str) -> &ColumnFamily {
        self.db
            .cf_handle(name)
            .expect("column family created at open")
    }
}

fn db_error(err: rocksdb::Error) -> ApiError {
    error!("file db failure: {err}");
    ApiError::Error
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, FileDb) {
        let dir = TempDir::new().unwrap();
        let db = FileDb::new(dir.path()).unwrap();
        (dir, db)
    }

    #[test]
    fn file_rows_round_trip_both_directions() {
        let (_dir, db) = open_db();
        let data = FileData {
            api_path: "/a.txt".to_owned(),
            file_size: 2048,
            iv: vec![[7u8; IV_SIZE], [9u8; IV_SIZE]],
            source_path: "/cache/u1".to_owned(),
        };
        db.add_or_update_file(&data).unwrap();

        assert_eq!(data, db.get_file_data("/a.txt").unwrap());
        assert_eq!("/cache/u1", db.get_source_path("/a.txt").unwrap());
        assert_eq!("/a.txt", db.get_api_path("/cache/u1").unwrap());
    }

    #[test]
    fn source_change_drops_stale_inverse_entry() {
        let (_dir, db) = open_db();
        let mut data = FileData {
            api_path: "/a.txt".to_owned(),
            file_size: 1,
            iv: Vec::new(),
            source_path: "/cache/old".to_owned(),
        };
        db.add_or_update_file(&data).unwrap();
        data.source_path = "/cache/new".to_owned();
        db.add_or_update_file(&data).unwrap();

        assert_eq!("/a.txt", db.get_api_path("/cache/new").unwrap());
        assert_eq!(Err(ApiError::ItemNotFound), db.get_api_path("/cache/old"));
    }

    #[test]
    fn directories_are_tracked_separately() {
        let (_dir, db) = open_db();
        db.add_directory("/dir", "/cache/dir-src").unwrap();

        assert!(db.is_directory("/dir").unwrap());
        assert!(!db.is_directory("/other").unwrap());
        assert_eq!("/cache/dir-src", db.get_directory_source_path("/dir").unwrap());
        assert_eq!(
            Err(ApiError::DirectoryNotFound),
            db.get_directory_source_path("/other")
        );
        assert_eq!(vec!["/dir".to_owned()], db.get_directory_api_path_list().unwrap());
    }

    #[test]
    fn remove_clears_every_family() {
        let (_dir, db) = open_db();
        db.add_or_update_file(&FileData {
            api_path: "/a.txt".to_owned(),
            file_size: 1,
            iv: Vec::new(),
            source_path: "/cache/u1".to_owned(),
        })
        .unwrap();
        db.remove_item("/a.txt").unwrap();

        assert_eq!(Err(ApiError::ItemNotFound), db.get_file_data("/a.txt"));
        assert_eq!(Err(ApiError::ItemNotFound), db.get_source_path("/a.txt"));
        assert_eq!(Err(ApiError::ItemNotFound), db.get_api_path("/cache/u1"));
    }
}
