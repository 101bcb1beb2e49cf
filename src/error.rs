//! Error type shared by every layer of the cache core.
//!
//! `ApiError` is a flat tagged enumeration rather than a nested error tree:
//! values cross thread, database and (through the mount shim) process
//! boundaries, so each variant has a stable snake_case wire name that the
//! `Display` impl and [`ApiError::from_name`] round-trip exactly.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type ApiResult<T> = Result<T, ApiError>;

/// Terminal status of a cache-core operation.
///
/// `Success` exists because open files latch "the terminal error of the most
/// recent download attempt" and that latch starts out successful; it is never
/// returned inside an `Err`.
#[derive(Clone, Copy, Debug, Default, Eq, Error, Hash, PartialEq)]
pub enum ApiError {
    #[default]
    #[error("success")]
    Success,
    #[error("access_denied")]
    AccessDenied,
    #[error("bad_address")]
    BadAddress,
    #[error("buffer_overflow")]
    BufferOverflow,
    #[error("buffer_too_small")]
    BufferTooSmall,
    #[error("comm_error")]
    CommError,
    #[error("decryption_error")]
    DecryptionError,
    #[error("directory_end_of_files")]
    DirectoryEndOfFiles,
    #[error("directory_exists")]
    DirectoryExists,
    #[error("directory_not_empty")]
    DirectoryNotEmpty,
    #[error("directory_not_found")]
    DirectoryNotFound,
    #[error("download_failed")]
    DownloadFailed,
    #[error("download_incomplete")]
    DownloadIncomplete,
    #[error("download_stopped")]
    DownloadStopped,
    #[error("empty_ring_buffer_chunk_size")]
    EmptyRingBufferChunkSize,
    #[error("empty_ring_buffer_size")]
    EmptyRingBufferSize,
    #[error("error")]
    Error,
    #[error("file_in_use")]
    FileInUse,
    #[error("file_size_mismatch")]
    FileSizeMismatch,
    #[error("incompatible_version")]
    IncompatibleVersion,
    #[error("invalid_handle")]
    InvalidHandle,
    #[error("invalid_operation")]
    InvalidOperation,
    #[error("invalid_ring_buffer_multiple")]
    InvalidRingBufferMultiple,
    #[error("invalid_ring_buffer_size")]
    InvalidRingBufferSize,
    #[error("invalid_version")]
    InvalidVersion,
    #[error("item_exists")]
    ItemExists,
    #[error("item_not_found")]
    ItemNotFound,
    #[error("no_disk_space")]
    NoDiskSpace,
    #[error("not_implemented")]
    NotImplemented,
    #[error("not_supported")]
    NotSupported,
    #[error("os_error")]
    OsError,
    #[error("out_of_memory")]
    OutOfMemory,
    #[error("permission_denied")]
    PermissionDenied,
    #[error("upload_failed")]
    UploadFailed,
    #[error("upload_stopped")]
    UploadStopped,
    #[error("xattr_buffer_small")]
    XattrBufferSmall,
    #[error("xattr_exists")]
    XattrExists,
    #[error("xattr_not_found")]
    XattrNotFound,
    #[error("xattr_too_big")]
    XattrTooBig,
}

impl ApiError {
    /// Parse the stable wire name back into a variant. Unknown names map to
    /// `Error`, matching how foreign peers are expected to degrade.
    pub fn from_name(name: &str) -> Self {
        match name {
            "success" => Self::Success,
            "access_denied" => Self::AccessDenied,
            "bad_address" => Self::BadAddress,
            "buffer_overflow" => Self::BufferOverflow,
            "buffer_too_small" => Self::BufferTooSmall,
            "comm_error" => Self::CommError,
            "decryption_error" => Self::DecryptionError,
            "directory_end_of_files" => Self::DirectoryEndOfFiles,
            "directory_exists" => Self::DirectoryExists,
            "directory_not_empty" => Self::DirectoryNotEmpty,
            "directory_not_found" => Self::DirectoryNotFound,
            "download_failed" => Self::DownloadFailed,
            "download_incomplete" => Self::DownloadIncomplete,
            "download_stopped" => Self::DownloadStopped,
            "empty_ring_buffer_chunk_size" => Self::EmptyRingBufferChunkSize,
            "empty_ring_buffer_size" => Self::EmptyRingBufferSize,
            "file_in_use" => Self::FileInUse,
            "file_size_mismatch" => Self::FileSizeMismatch,
            "incompatible_version" => Self::IncompatibleVersion,
            "invalid_handle" => Self::InvalidHandle,
            "invalid_operation" => Self::InvalidOperation,
            "invalid_ring_buffer_multiple" => Self::InvalidRingBufferMultiple,
            "invalid_ring_buffer_size" => Self::InvalidRingBufferSize,
            "invalid_version" => Self::InvalidVersion,
            "item_exists" => Self::ItemExists,
            "item_not_found" => Self::ItemNotFound,
            "no_disk_space" => Self::NoDiskSpace,
            "not_implemented" => Self::NotImplemented,
            "not_supported" => Self::NotSupported,
            "os_error" => Self::OsError,
            "out_of_memory" => Self::OutOfMemory,
            "permission_denied" => Self::PermissionDenied,
            "upload_failed" => Self::UploadFailed,
            "upload_stopped" => Self::UploadStopped,
            "xattr_buffer_small" => Self::XattrBufferSmall,
            "xattr_exists" => Self::XattrExists,
            "xattr_not_found" => Self::XattrNotFound,
            "xattr_too_big" => Self::XattrTooBig,
            _ => Self::Error,
        }
    }

    /// Translate to the errno the fuse shim answers the kernel with.
    ///
    /// `Success` maps to 0. Cancellation (`download_stopped`,
    /// `upload_stopped`) is only an EIO if a user operation was actually
    /// waiting on the result, which is the caller's call to make; here it
    /// falls through to the EIO default like any other internal failure.
    pub fn to_errno(self) -> libc::c_int {
        match self {
            Self::Success => 0,
            Self::AccessDenied | Self::PermissionDenied => libc::EACCES,
            Self::BadAddress => libc::EFAULT,
            Self::DirectoryEndOfFiles => libc::ENOENT,
            Self::DirectoryExists | Self::ItemExists => libc::EEXIST,
            Self::DirectoryNotEmpty => libc::ENOTEMPTY,
            Self::DirectoryNotFound | Self::ItemNotFound => libc::ENOENT,
            Self::FileInUse => libc::EBUSY,
            Self::InvalidHandle => libc::EBADF,
            Self::NoDiskSpace => libc::ENOSPC,
            Self::NotImplemented => libc::ENOSYS,
            Self::NotSupported => libc::EPERM,
            Self::OutOfMemory => libc::ENOMEM,
            Self::XattrBufferSmall | Self::BufferTooSmall => libc::ERANGE,
            Self::XattrExists => libc::EEXIST,
            Self::XattrNotFound => libc::ENODATA,
            Self::XattrTooBig => libc::E2BIG,
            _ => libc::EIO,
        }
    }

    /// Whether this value represents an actual failure.
    pub fn is_error(self) -> bool {
        self != Self::Success
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ItemNotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => Self::ItemExists,
            std::io::ErrorKind::StorageFull => Self::NoDiskSpace,
            _ => Self::OsError,
        }
    }
}

#[cfg(test)]
mod test {
    use super::ApiError;

    #[test]
    fn names_round_trip() {
        for err in [
            ApiError::Success,
            ApiError::CommError,
            ApiError::DownloadIncomplete,
            ApiError::DownloadStopped,
            ApiError::ItemNotFound,
            ApiError::UploadStopped,
            ApiError::XattrTooBig,
        ] {
            assert_eq!(err, ApiError::from_name(&err.to_string()));
        }
    }

    #[test]
    fn unknown_name_degrades_to_error() {
        assert_eq!(ApiError::Error, ApiError::from_name("no_such_error"));
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(0, ApiError::Success.to_errno());
        assert_eq!(libc::ENOENT, ApiError::ItemNotFound.to_errno());
        assert_eq!(libc::EACCES, ApiError::AccessDenied.to_errno());
        assert_eq!(libc::ENOTEMPTY, ApiError::DirectoryNotEmpty.to_errno());
        assert_eq!(libc::ENOSPC, ApiError::NoDiskSpace.to_errno());
        assert_eq!(libc::ENOSYS, ApiError::NotImplemented.to_errno());
        assert_eq!(libc::EPERM, ApiError::NotSupported.to_errno());
        assert_eq!(libc::EIO, ApiError::CommError.to_errno());
        assert_eq!(libc::EIO, ApiError::DownloadStopped.to_errno());
    }
}
