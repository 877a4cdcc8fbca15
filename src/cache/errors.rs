//! Cache Error Types
//!
//! Typed failures for on-disk cache operations.
//! Maps each variant to a libc errno for the filesystem adapter.

use std::io;
use std::path::PathBuf;

/// Cache operation error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Non-regular source file: {0:?}")]
    NonRegularSource(PathBuf),

    #[error("Non-regular destination file: {0:?}")]
    NonRegularDestination(PathBuf),

    #[error("Failed to {op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Item not open: {0}")]
    NotOpen(String),
}

impl CacheError {
    /// Wrap an I/O error with the operation and path that produced it
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Map cache error to an appropriate libc errno
    pub fn to_errno(&self) -> i32 {
        match self {
            CacheError::NonRegularSource(_) => libc::EINVAL,
            CacheError::NonRegularDestination(_) => libc::EISDIR,
            CacheError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            CacheError::NotOpen(_) => libc::EBADF,
        }
    }
}
