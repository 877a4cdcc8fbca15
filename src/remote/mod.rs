//! Remote storage abstraction
//!
//! The cache never talks to a storage backend directly. It sees the remote
//! through these traits: object size, modification time and content hash
//! are all it needs to decide whether a cached copy is still current.

pub mod hash;
pub mod local;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;

pub use hash::{common_hash, HashType, LOCAL_HASHES};
pub use local::LocalRemote;

/// A single object stored on the remote
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Path of the object relative to the remote root
    fn remote(&self) -> &str;

    /// Object size in bytes
    fn size(&self) -> u64;

    /// Modification time as reported by the backend
    ///
    /// May need a round trip on backends where modtimes are metadata.
    async fn mod_time(&self) -> SystemTime;

    /// Content hash of the object, lowercase hex
    async fn hash(&self, ty: HashType) -> Result<String>;

    /// Stream the object's content into the local file `dst`
    ///
    /// `dst` is created or truncated. Returns the number of bytes written.
    async fn copy_to(&self, dst: &Path) -> Result<u64>;
}

/// The storage backend being mirrored by the cache
#[async_trait]
pub trait Remote: Send + Sync {
    /// Short identifier of the remote (used in the cache directory layout)
    fn name(&self) -> &str;

    /// Root path on the remote, slash separated
    fn root(&self) -> &str;

    /// Modification time precision, `None` if modtimes are not supported
    fn precision(&self) -> Option<Duration>;

    /// Hash types the backend can produce
    fn hashes(&self) -> &[HashType];

    /// Look up an object by its remote path
    async fn new_object(&self, remote: &str) -> Result<Arc<dyn RemoteObject>>;
}
