//! Sparse local source file.
//!
//! One of these backs every materialized open file. It does raw range I/O
//! only; chunk bookkeeping lives with the owning open file, which holds its
//! own lock around bitmap updates. The file handle is opened lazily and
//! shared read/write so upload workers can re-open the same path
//! concurrently.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::ApiResult;

pub struct SourceFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl SourceFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file (and its parent directory) and reserve `size` bytes
    /// of sparse length if the file is currently shorter.
    pub fn allocate(&self, size: u64) -> ApiResult<()> {
        self.with_file(|file| {
            if file.metadata()?.len() < size {
                file.set_len(size)?;
            }
            Ok(())
        })
    }

    /// Read up to `len` bytes at `offset`. Returns short data at EOF, never
    /// an error for reading past the end.
    pub fn read(&self, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        self.with_file(|file| {
            let mut data = vec![0u8; len];
            let mut total = 0usize;
            while total < len {
                match file.read_at(&mut data[total..], offset + total as u64) {
                    Ok(0) => break,
                    Ok(count) => total += count,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                }
            }
            data.truncate(total);
            Ok(data)
        })
    }

    /// Write all of `data` at `offset`, growing the file as needed.
    pub fn write(&self, offset: u64, data: &[u8]) -> ApiResult<usize> {
        self.with_file(|file| {
            file.write_all_at(data, offset)?;
            Ok(data.len())
        })
    }

    pub fn truncate(&self, size: u64) -> ApiResult<()> {
        self.with_file(|file| file.set_len(size))
    }

    /// Best-effort sync of dirty pages.
    pub fn flush(&self) -> ApiResult<()> {
        self.with_file(|file| file.sync_data())
    }

    pub fn len(&self) -> ApiResult<u64> {
        self.with_file(|file| Ok(file.metadata()?.len()))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Drop the open handle; a later call re-opens by path.
    pub fn close(&self) {
        *self.file.lock() = None;
    }

    /// Remove the file from disk, closing the handle first.
    pub fn unlink(&self) -> ApiResult<()> {
        self.close();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn with_file<T>(&self, op: impl FnOnce(&File) -> io::Result<T>) -> ApiResult<T> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            *guard = Some(file);
        }
        Ok(op(guard.as_ref().expect("file opened above"))?)
    }
}

#[cfg(test)]
mod test {
    use super::SourceFile;
    use tempfile::TempDir;

    #[test]
    fn writes_then_reads_across_offsets() {
        let dir = TempDir::new().unwrap();
        let file = SourceFile::new(dir.path().join("src"));

        assert_eq!(4, file.write(0, b"abcd").unwrap());
        assert_eq!(2, file.write(6, b"xy").unwrap());

        assert_eq!(b"abcd".to_vec(), file.read(0, 4).unwrap());
        // The gap is zero-filled by the OS.
        assert_eq!(vec![0, 0], file.read(4, 2).unwrap());
        assert_eq!(b"xy".to_vec(), file.read(6, 2).unwrap());
    }

    #[test]
    fn reads_past_eof_are_short() {
        let dir = TempDir::new().unwrap();
        let file = SourceFile::new(dir.path().join("src"));
        file.write(0, b"abc").unwrap();

        assert_eq!(b"abc".to_vec(), file.read(0, 100).unwrap());
        assert!(file.read(50, 10).unwrap().is_empty());
    }

    #[test]
    fn allocate_reserves_sparse_length() {
        let dir = TempDir::new().unwrap();
        let file = SourceFile::new(dir.path().join("src"));
        file.allocate(4096).unwrap();
        assert_eq!(4096, file.len().unwrap());

        // Allocation never shrinks.
        file.allocate(16).unwrap();
        assert_eq!(4096, file.len().unwrap());

        file.truncate(16).unwrap();
        assert_eq!(16, file.len().unwrap());
    }

    #[test]
    fn unlink_removes_and_close_allows_reopen() {
        let dir = TempDir::new().unwrap();
        let file = SourceFile::new(dir.path().join("src"));
        file.write(0, b"abc").unwrap();
        file.close();
        assert_eq!(b"abc".to_vec(), file.read(0, 3).unwrap());

        file.unlink().unwrap();
        assert!(!file.exists());
    }
}
