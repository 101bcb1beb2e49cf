//! Single-instance mount lock.
//!
//! A mount takes an advisory `flock` on `state/<mutex_id>.lock` so a second
//! instance against the same data directory fails fast instead of fighting
//! over the cache, and records `{Active, Location, PID}` in
//! `state/<mutex_id>.json` for tooling to inspect.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

/// Outcome of a lock attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockResult {
    Success,
    /// Another live instance holds the lock.
    Locked,
    Failure,
}

/// Mount state recorded next to the lock.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MountState {
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "PID")]
    pub pid: i64,
}

pub struct LockFile {
    lock_path: PathBuf,
    state_path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    pub fn new(state_directory: &Path, mutex_id: &str) -> Self {
        Self {
            lock_path: state_directory.join(format!("{mutex_id}.lock")),
            state_path: state_directory.join(format!("{mutex_id}.json")),
            file: None,
        }
    }

    /// Try to take the exclusive advisory lock without blocking.
    pub fn grab_lock(&mut self) -> LockResult {
        if self.file.is_some() {
            return LockResult::Success;
        }
        if let Some(parent) = self.lock_path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return LockResult::Failure;
            }
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(err) => {
                warn!("failed to open lock file {}: {err}", self.lock_path.display());
                return LockResult::Failure;
            }
        };

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            self.file = Some(file);
            return LockResult::Success;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EWOULDBLOCK) => LockResult::Locked,
            _ => LockResult::Failure,
        }
    }

    /// Record the mount state. Requires the lock to be held.
    pub fn set_mount_state(&self, active: bool, location: &str) -> bool {
        if self.file.is_none() {
            return false;
        }
        let state = MountState {
            active,
            location: location.to_owned(),
            pid: std::process::id() as i64,
        };
        match serde_json::to_string_pretty(&state) {
            Ok(text) => fs::write(&self.state_path, text).is_ok(),
            Err(_) => false,
        }
    }

    pub fn get_mount_state(&self) -> Option<MountState> {
        let text = fs::read_to_string(&self.state_path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Drop the lock. The state file is left behind as a tombstone with
    /// `Active` cleared.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Some(mut state) = self.get_mount_state() {
                state.active = false;
                state.pid = 0;
                if let Ok(text) = serde_json::to_string_pretty(&state) {
                    let _ = fs::write(&self.state_path, text);
                }
            }
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_lock_in_same_process_is_reported_locked() {
        let dir = TempDir::new().unwrap();
        let mut first = LockFile::new(dir.path(), "mnt");
        assert_eq!(LockResult::Success, first.grab_lock());
        // flock is per open-file-description, so a second descriptor in the
        // same process observes the conflict just like another process.
        let mut second = LockFile::new(dir.path(), "mnt");
        assert_eq!(LockResult::Locked, second.grab_lock());

        first.release();
        assert_eq!(LockResult::Success, second.grab_lock());
    }

    #[test]
    fn mount_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut lock = LockFile::new(dir.path(), "mnt");
        assert_eq!(LockResult::Success, lock.grab_lock());
        assert!(lock.set_mount_state(true, "/mnt/remote"));

        let state = lock.get_mount_state().unwrap();
        assert!(state.active);
        assert_eq!("/mnt/remote", state.location);
        assert_eq!(std::process::id() as i64, state.pid);

        lock.release();
        let state = lock.get_mount_state().unwrap();
        assert!(!state.active);
        assert_eq!(0, state.pid);
    }

    #[test]
    fn state_without_lock_is_rejected() {
        let dir = TempDir::new().unwrap();
        let lock = LockFile::new(dir.path(), "mnt");
        assert!(!lock.set_mount_state(true, "/mnt/remote"));
        assert!(lock.get_mount_state().is_none());
    }
}
