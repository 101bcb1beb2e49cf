//! SQLite-backed item metadata store.
//!
//! One table, `meta`, keyed by api path. The four attributes the hot paths
//! filter or sort on (`directory`, `pinned`, `size`, `source_path`) are
//! promoted to real columns; every other key rides in the JSON `data`
//! column and is reassembled into the map on read.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{error, warn};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{ApiError, ApiResult};
use crate::types::{
    FileMeta, META_DIRECTORY, META_PINNED, META_SIZE, META_SOURCE, meta_bool, meta_bool_string,
};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS meta \
     (\
     api_path TEXT PRIMARY KEY ASC, \
     data TEXT, \
     directory INTEGER, \
     pinned INTEGER, \
     size INTEGER, \
     source_path TEXT\
     );";

pub struct MetaDb {
    conn: Mutex<Connection>,
}

impl MetaDb {
    /// Open (creating if needed) `meta.db` inside `db_directory`.
    pub fn new(db_directory: &Path) -> ApiResult<Self> {
        fs::create_dir_all(db_directory)?;
        let conn = Connection::open(db_directory.join("meta.db")).map_err(db_error)?;
        conn.execute(CREATE_TABLE, []).map_err(db_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[doc(hidden)]
    pub fn open_in_memory() -> ApiResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_error)?;
        conn.execute(CREATE_TABLE, []).map_err(db_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn clear(&self) -> ApiResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM meta", [])
            .map(|_| ())
            .map_err(db_error)
    }

    /// Reassemble the full metadata map for `api_path`.
    pub fn get_item_meta(&self, api_path: &str) -> ApiResult<FileMeta> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT data, directory, pinned, size, source_path FROM meta \
                 WHERE api_path = ?1",
                params![api_path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_error)?;

        let Some((data, directory, pinned, size, source_path)) = row else {
            return Err(ApiError::ItemNotFound);
        };

        let mut meta: FileMeta =
            serde_json::from_str::<BTreeMap<String, String>>(&data).unwrap_or_else(|err| {
                warn!("corrupt meta data column for {api_path}: {err}");
                BTreeMap::new()
            });
        meta.insert(META_DIRECTORY.to_owned(), meta_bool_string(directory == 1));
        meta.insert(META_PINNED.to_owned(), meta_bool_string(pinned == 1));
        meta.insert(META_SIZE.to_owned(), (size as u64).to_string());
        meta.insert(META_SOURCE.to_owned(), source_path);
        Ok(meta)
    }

    /// Fetch one metadata value without materializing the whole map.
    pub fn get_item_meta_value(&self, api_path: &str, key: &str) -> ApiResult<String> {
        let meta = self.get_item_meta(api_path)?;
        meta.get(key).cloned().ok_or(ApiError::ItemNotFound)
    }

    pub fn set_item_meta(&self, api_path: &str, key: &str, value: &str) -> ApiResult<()> {
        let mut update = FileMeta::new();
        update.insert(key.to_owned(), value.to_owned());
        self.set_item_meta_map(api_path, &update)
    }

    /// Merge `meta` into the stored map, creating the row if absent.
    pub fn set_item_meta_map(&self, api_path: &str, meta: &FileMeta) -> ApiResult<()> {
        let mut existing = match self.get_item_meta(api_path) {
            Ok(existing) => existing,
            Err(ApiError::ItemNotFound) => FileMeta::new(),
            Err(err) => return Err(err),
        };
        for (key, value) in meta {
            existing.insert(key.clone(), value.clone());
        }
        self.update_item_meta(api_path, existing)
    }

    /// Remove a single key. The promoted columns cannot be removed.
    pub fn remove_item_meta(&self, api_path: &str, key: &str) -> ApiResult<()> {
        if matches!(key, META_DIRECTORY | META_PINNED | META_SIZE | META_SOURCE) {
            warn!("ignoring removal of promoted meta key {key} for {api_path}");
            return Ok(());
        }
        let mut meta = self.get_item_meta(api_path)?;
        meta.remove(key);
        self.update_item_meta(api_path, meta)
    }

    pub fn remove_api_path(&self, api_path: &str) -> ApiResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM meta WHERE api_path = ?1", params![api_path])
            .map(|_| ())
            .map_err(db_error)
    }

    /// Move a row to a new api path, keeping every attribute.
    pub fn rename_item_meta(&self, from_api_path: &str, to_api_path: &str) -> ApiResult<()> {
        let meta = self.get_item_meta(from_api_path)?;
        self.remove_api_path(from_api_path)?;
        self.update_item_meta(to_api_path, meta)
    }

    /// Inverse lookup: which api path owns `source_path`.
    pub fn get_api_path(&self, source_path: &str) -> ApiResult<String> {
        self.conn
            .lock()
            .query_row(
                "SELECT api_path FROM meta WHERE source_path = ?1 LIMIT 1",
                params![source_path],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(db_error)?
            .ok_or(ApiError::ItemNotFound)
    }

    pub fn get_api_path_list(&self) -> ApiResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT api_path FROM meta")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    pub fn get_pinned_files(&self) -> ApiResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT api_path FROM meta WHERE pinned = 1")
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    pub fn get_total_item_count(&self) -> ApiResult<u64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(api_path) FROM meta", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|count| count as u64)
            .map_err(db_error)
    }

    /// Sum of file sizes; directories are excluded.
    pub fn get_total_size(&self) -> ApiResult<u64> {
        self.conn
            .lock()
            .query_row(
                "SELECT COALESCE(SUM(size), 0) FROM meta WHERE directory = 0",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|total| total as u64)
            .map_err(db_error)
    }

    // Replace the stored row. Promoted values are pulled out of the map;
    // directories never carry pinned/size/source.
    fn update_item_meta(&self, api_path: &str, mut meta: FileMeta) -> ApiResult<()> {
        let directory = meta
            .get(META_DIRECTORY)
            .map(|value| meta_bool(value))
            .unwrap_or(false);
        let pinned = !directory
            && meta
                .get(META_PINNED)
                .map(|value| meta_bool(value))
                .unwrap_or(false);
        let size = if directory {
            0
        } else {
            meta.get(META_SIZE)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let source_path = if directory {
            String::new()
        } else {
            meta.get(META_SOURCE).cloned().unwrap_or_default()
        };

        meta.remove(META_DIRECTORY);
        meta.remove(META_PINNED);
        meta.remove(META_SIZE);
        meta.remove(META_SOURCE);

        let data = serde_json::to_string(&meta).map_err(|_| ApiError::Error)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO meta \
                 (api_path, data, directory, pinned, size, source_path) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    api_path,
                    data,
                    directory as i64,
                    pinned as i64,
                    size as i64,
                    source_path
                ],
            )
            .map(|_| ())
            .map_err(db_error)
    }
}

fn db_error(err: rusqlite::Error) -> ApiError {
    error!("meta db failure: {err}");
    ApiError::Error
}
