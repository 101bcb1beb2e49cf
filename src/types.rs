//! Core data model: meta keys, filesystem items, open flags and handles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Recognized metadata keys. Values are strings for uniform transport;
/// callers coerce. Unrecognized keys may exist alongside these and are
/// carried opaquely.
pub const META_ACCESSED: &str = "accessed";
pub const META_ATTRIBUTES: &str = "attributes";
pub const META_BACKUP: &str = "backup";
pub const META_CHANGED: &str = "changed";
pub const META_CREATION: &str = "creation";
pub const META_DIRECTORY: &str = "directory";
pub const META_GID: &str = "gid";
pub const META_KEY: &str = "key";
pub const META_MODE: &str = "mode";
pub const META_MODIFIED: &str = "modified";
pub const META_OSXFLAGS: &str = "flags";
pub const META_PINNED: &str = "pinned";
pub const META_SIZE: &str = "size";
pub const META_SOURCE: &str = "source";
pub const META_UID: &str = "uid";
pub const META_WRITTEN: &str = "written";

/// All keys the meta store treats as recognized.
pub const META_USED_NAMES: &[&str] = &[
    META_ACCESSED,
    META_ATTRIBUTES,
    META_BACKUP,
    META_CHANGED,
    META_CREATION,
    META_DIRECTORY,
    META_GID,
    META_KEY,
    META_MODE,
    META_MODIFIED,
    META_OSXFLAGS,
    META_PINNED,
    META_SIZE,
    META_SOURCE,
    META_UID,
    META_WRITTEN,
];

/// String-to-string metadata map. Ordered so JSON renderings are stable.
pub type FileMeta = BTreeMap<String, String>;

/// Handle issued by the open-file table to the mount layer.
pub type FileHandle = u64;

/// Denormalized view of an item's meta used on the hot path.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilesystemItem {
    pub api_path: String,
    pub api_parent: String,
    pub directory: bool,
    pub size: u64,
    pub source_path: String,
}

/// A single directory listing entry.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DirectoryItem {
    #[serde(rename = "path")]
    pub api_path: String,
    #[serde(rename = "parent")]
    pub api_parent: String,
    pub directory: bool,
    pub size: u64,
    #[serde(default)]
    pub meta: FileMeta,
}

/// Chunk download scheduling policy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    #[default]
    Direct,
    Fallback,
    RingBuffer,
}

impl DownloadType {
    pub fn from_config_value(value: &str) -> Self {
        match value {
            "fallback" => Self::Fallback,
            "ring_buffer" => Self::RingBuffer,
            _ => Self::Direct,
        }
    }
}

/// Process exit codes used by the CLI surface around this crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    CommunicationError = -1,
    FileCreationFailed = -2,
    IncompatibleVersion = -3,
    InvalidSyntax = -4,
    LockFailed = -5,
    MountActive = -6,
    MountResult = -7,
    NotMounted = -8,
    StartupException = -9,
    FailedToGetMountState = -10,
    ExportFailed = -11,
    ImportFailed = -12,
    OptionNotFound = -13,
    InvalidProviderType = -14,
    SetOptionNotFound = -15,
    PinFailed = -16,
    UnpinFailed = -17,
    InitFailed = -18,
}

bitflags::bitflags! {
    /// Per-handle open flags recorded by the open-file table. These mirror
    /// the access intent the mount layer saw, not the raw OS flag word.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct OpenFlags: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const APPEND    = 1 << 2;
        const TRUNCATE  = 1 << 3;
        const CREATE    = 1 << 4;
        const DIRECTORY = 1 << 5;
    }
}

impl OpenFlags {
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRITE | Self::APPEND | Self::TRUNCATE)
    }
}

/// Process-wide handle allocator. Handles are monotonically increasing and
/// never 0, so 0 can serve as an invalid-handle sentinel in shims.
#[derive(Debug, Default)]
pub struct HandleSource {
    next: AtomicU64,
}

impl HandleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> FileHandle {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Current time as a nanosecond-since-epoch decimal string, the format all
/// meta timestamps use.
pub fn unix_time_now() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().to_string())
        .unwrap_or_else(|_| "0".to_owned())
}

/// Coerce a meta boolean ("true"/"false", with "1"/"0" accepted).
pub fn meta_bool(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Render a meta boolean.
pub fn meta_bool_string(value: bool) -> String {
    if value { "true".to_owned() } else { "false".to_owned() }
}
