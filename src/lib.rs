//! CloudMount Cache - local disk cache for remote filesystems
//!
//! Mirrors remote files onto local disk so a FUSE layer can serve repeated
//! reads and writes without going back to the backend, while keeping the
//! cache bounded by age and size and consistent with the remote objects.

pub mod cache;
pub mod remote;

pub use cache::{Cache, CacheError, CacheOptions};
pub use remote::{Remote, RemoteObject};
