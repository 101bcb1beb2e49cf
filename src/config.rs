//! Application configuration.
//!
//! `AppConfig` is the JSON document at `<data_directory>/config.json`.
//! Recognized keys are typed fields; everything else is preserved verbatim
//! through a load/save round trip so newer or provider-specific settings
//! survive older builds. Clamps are applied at the accessor, not at rest,
//! so the file keeps whatever the user wrote.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::events::EventLevel;
use crate::types::DownloadType;

pub const DEFAULT_API_PORT: u16 = 10000;
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 8 * 1024 * 1024;
pub const MIN_CHUNK_SIZE_BYTES: u64 = 64 * 1024;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u8 = 30;
pub const MIN_DOWNLOAD_TIMEOUT_SECS: u8 = 5;
pub const DEFAULT_EVICTION_DELAY_MINS: u32 = 10;
pub const DEFAULT_HIGH_FREQ_INTERVAL_SECS: u8 = 30;
pub const DEFAULT_MED_FREQ_INTERVAL_SECS: u32 = 2 * 60;
pub const DEFAULT_LOW_FREQ_INTERVAL_SECS: u32 = 60 * 60;
pub const DEFAULT_MAX_CACHE_SIZE_BYTES: u64 = 20 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_UPLOAD_COUNT: u8 = 5;
pub const DEFAULT_READ_AHEAD_COUNT: u8 = 4;
pub const DEFAULT_RETRY_READ_COUNT: u16 = 6;
pub const MIN_RETRY_READ_COUNT: u16 = 2;
pub const DEFAULT_RING_BUFFER_FILE_SIZE: u16 = 512;
pub const MIN_RING_BUFFER_FILE_SIZE: u16 = 64;
pub const MAX_RING_BUFFER_FILE_SIZE: u16 = 1024;
pub const CONFIG_VERSION: u64 = 1;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(rename = "ApiAuth")]
    pub api_auth: String,
    #[serde(rename = "ApiPort")]
    pub api_port: u16,
    #[serde(rename = "ApiUser")]
    pub api_user: String,
    #[serde(rename = "CacheDirectory")]
    pub cache_directory: String,
    #[serde(rename = "ChunkSizeBytes")]
    pub chunk_size_bytes: u64,
    #[serde(rename = "DownloadTimeoutSecs")]
    pub download_timeout_secs: u8,
    #[serde(rename = "EnableChunkDownloaderTimeout")]
    pub enable_chunk_downloader_timeout: bool,
    #[serde(rename = "EnableMaxCacheSize")]
    pub enable_max_cache_size: bool,
    #[serde(rename = "EventLevel")]
    pub event_level: EventLevel,
    #[serde(rename = "EvictionDelayMins")]
    pub eviction_delay_mins: u32,
    #[serde(rename = "EvictionUsesAccessedTime")]
    pub eviction_uses_accessed_time: bool,
    #[serde(rename = "HighFrequencyIntervalSecs")]
    pub high_frequency_interval_secs: u8,
    #[serde(rename = "LowFrequencyIntervalSecs")]
    pub low_frequency_interval_secs: u32,
    #[serde(rename = "MaxCacheSizeBytes")]
    pub max_cache_size_bytes: u64,
    #[serde(rename = "MaxUploadCount")]
    pub max_upload_count: u8,
    #[serde(rename = "MedFrequencyIntervalSecs")]
    pub med_frequency_interval_secs: u32,
    #[serde(rename = "PreferredDownloadType")]
    pub preferred_download_type: DownloadType,
    #[serde(rename = "ReadAheadCount")]
    pub read_ahead_count: u8,
    #[serde(rename = "RetryReadCount")]
    pub retry_read_count: u16,
    #[serde(rename = "RingBufferFileSize")]
    pub ring_buffer_file_size: u16,
    #[serde(rename = "Version")]
    pub version: u64,

    // Provider blocks are opaque to the core and round-trip untouched.
    #[serde(rename = "EncryptConfig", skip_serializing_if = "Value::is_null")]
    pub encrypt_config: Value,
    #[serde(rename = "HostConfig", skip_serializing_if = "Value::is_null")]
    pub host_config: Value,
    #[serde(rename = "RemoteConfig", skip_serializing_if = "Value::is_null")]
    pub remote_config: Value,
    #[serde(rename = "S3Config", skip_serializing_if = "Value::is_null")]
    pub s3_config: Value,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,

    #[serde(skip)]
    data_directory: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_auth: String::new(),
            api_port: DEFAULT_API_PORT,
            api_user: "cachefs".to_owned(),
            cache_directory: String::new(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            enable_chunk_downloader_timeout: true,
            enable_max_cache_size: false,
            event_level: EventLevel::Info,
            eviction_delay_mins: DEFAULT_EVICTION_DELAY_MINS,
            eviction_uses_accessed_time: false,
            high_frequency_interval_secs: DEFAULT_HIGH_FREQ_INTERVAL_SECS,
            low_frequency_interval_secs: DEFAULT_LOW_FREQ_INTERVAL_SECS,
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE_BYTES,
            max_upload_count: DEFAULT_MAX_UPLOAD_COUNT,
            med_frequency_interval_secs: DEFAULT_MED_FREQ_INTERVAL_SECS,
            preferred_download_type: DownloadType::Direct,
            read_ahead_count: DEFAULT_READ_AHEAD_COUNT,
            retry_read_count: DEFAULT_RETRY_READ_COUNT,
            ring_buffer_file_size: DEFAULT_RING_BUFFER_FILE_SIZE,
            version: CONFIG_VERSION,
            encrypt_config: Value::Null,
            host_config: Value::Null,
            remote_config: Value::Null,
            s3_config: Value::Null,
            extra: BTreeMap::new(),
            data_directory: PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Configuration rooted at `data_directory` with every default value.
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            ..Self::default()
        }
    }

    /// Load `config.json` from `data_directory`, or fall back to defaults
    /// (and write them out) when the file does not exist yet.
    pub fn load(data_directory: impl Into<PathBuf>) -> ApiResult<Self> {
        let data_directory = data_directory.into();
        let path = data_directory.join("config.json");
        if !path.exists() {
            let config = Self::new(data_directory);
            config.save()?;
            return Ok(config);
        }

        let text = fs::read_to_string(&path)?;
        let mut config: Self = serde_json::from_str(&text).map_err(|err| {
            warn!("failed to parse {}: {err}", path.display());
            ApiError::Error
        })?;
        config.data_directory = data_directory;
        if config.version > CONFIG_VERSION {
            return Err(ApiError::IncompatibleVersion);
        }
        Ok(config)
    }

    /// Persist atomically: write a temp file next to the target, then rename.
    pub fn save(&self) -> ApiResult<()> {
        fs::create_dir_all(&self.data_directory)?;
        let path = self.config_file();
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(self).map_err(|_| ApiError::Error)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_directory.join("config.json")
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn db_directory(&self) -> PathBuf {
        self.data_directory.join("db")
    }

    /// Root of the sparse source-file cache.
    pub fn cache_directory(&self) -> PathBuf {
        if self.cache_directory.is_empty() {
            self.data_directory.join("cache")
        } else {
            PathBuf::from(&self.cache_directory)
        }
    }

    pub fn ring_buffer_directory(&self) -> PathBuf {
        self.data_directory.join("ring_buffer")
    }

    pub fn state_directory(&self) -> PathBuf {
        self.data_directory.join("state")
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_bytes.max(MIN_CHUNK_SIZE_BYTES)
    }

    /// Idle-download timeout, clamped to the floor.
    pub fn chunk_downloader_timeout_secs(&self) -> u8 {
        self.download_timeout_secs.max(MIN_DOWNLOAD_TIMEOUT_SECS)
    }

    pub fn max_upload_count(&self) -> u8 {
        self.max_upload_count.max(1)
    }

    pub fn retry_read_count(&self) -> u16 {
        self.retry_read_count.max(MIN_RETRY_READ_COUNT)
    }

    /// Ring size in chunks, clamped to `[64, 1024]`.
    pub fn ring_buffer_file_size(&self) -> u16 {
        self.ring_buffer_file_size
            .clamp(MIN_RING_BUFFER_FILE_SIZE, MAX_RING_BUFFER_FILE_SIZE)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accessors_apply_clamps() {
        let mut config = AppConfig::new("/tmp/cachefs-test");
        config.download_timeout_secs = 1;
        assert_eq!(MIN_DOWNLOAD_TIMEOUT_SECS, config.chunk_downloader_timeout_secs());
        config.max_upload_count = 0;
        assert_eq!(1, config.max_upload_count());
        config.retry_read_count = 0;
        assert_eq!(MIN_RETRY_READ_COUNT, config.retry_read_count());
        config.ring_buffer_file_size = 8;
        assert_eq!(MIN_RING_BUFFER_FILE_SIZE, config.ring_buffer_file_size());
        config.ring_buffer_file_size = 4096;
        assert_eq!(MAX_RING_BUFFER_FILE_SIZE, config.ring_buffer_file_size());
        config.chunk_size_bytes = 1;
        assert_eq!(MIN_CHUNK_SIZE_BYTES, config.chunk_size());
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let text = r#"{
            "ApiPort": 11000,
            "EventLevel": "debug",
            "PreferredDownloadType": "fallback",
            "SomeFutureKey": {"nested": true}
        }"#;
        let config: AppConfig = serde_json::from_str(text).unwrap();
        assert_eq!(11000, config.api_port);
        assert_eq!(EventLevel::Debug, config.event_level);
        assert_eq!(DownloadType::Fallback, config.preferred_download_type);
        assert!(config.extra.contains_key("SomeFutureKey"));

        let rendered = serde_json::to_string(&config).unwrap();
        let reparsed: AppConfig = serde_json::from_str(&rendered).unwrap();
        assert!(reparsed.extra.contains_key("SomeFutureKey"));
    }

    #[test]
    fn default_directories_derive_from_data_directory() {
        let config = AppConfig::new("/data/mount");
        assert_eq!(PathBuf::from("/data/mount/cache"), config.cache_directory());
        assert_eq!(PathBuf::from("/data/mount/db"), config.db_directory());
        assert_eq!(
            PathBuf::from("/data/mount/ring_buffer"),
            config.ring_buffer_directory()
        );
    }
}
