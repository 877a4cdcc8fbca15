//! Local directory remote
//!
//! Exposes a directory on local disk through the `Remote` traits. The
//! operator binary caches one of these, and the cache tests use it as a
//! stand-in for a network backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::trace;

use super::hash::{hash_file, HashType};
use super::{Remote, RemoteObject};

/// Hashes a local directory can produce
const LOCAL_REMOTE_HASHES: &[HashType] = &[HashType::Md5, HashType::Sha1];

/// A remote backed by a local directory
pub struct LocalRemote {
    /// Identifier used in the cache layout
    name: String,
    /// Root directory on disk
    root: PathBuf,
    /// Root directory as a slash separated string
    root_str: String,
}

impl LocalRemote {
    /// Create a remote serving the files under `root`
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root_str = root.to_string_lossy().replace('\\', "/");
        Self {
            name: name.to_string(),
            root,
            root_str,
        }
    }

    /// Local path for a remote name
    fn path_for(&self, remote: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in remote.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl Remote for LocalRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        &self.root_str
    }

    fn precision(&self) -> Option<Duration> {
        Some(Duration::from_nanos(1))
    }

    fn hashes(&self) -> &[HashType] {
        LOCAL_REMOTE_HASHES
    }

    async fn new_object(&self, remote: &str) -> Result<Arc<dyn RemoteObject>> {
        let path = self.path_for(remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Object not found: {}", remote))?;

        if !metadata.is_file() {
            return Err(anyhow!("Not a file: {}", remote));
        }

        let mod_time = metadata
            .modified()
            .with_context(|| format!("Failed to read modification time: {:?}", path))?;

        trace!(remote = remote, size = metadata.len(), "Found local object");

        Ok(Arc::new(LocalObject {
            remote: remote.trim_matches('/').to_string(),
            path,
            size: metadata.len(),
            mod_time,
        }))
    }
}

/// A file inside a `LocalRemote`
#[derive(Debug, Clone)]
pub struct LocalObject {
    remote: String,
    path: PathBuf,
    size: u64,
    mod_time: SystemTime,
}

impl LocalObject {
    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RemoteObject for LocalObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn mod_time(&self) -> SystemTime {
        self.mod_time
    }

    async fn hash(&self, ty: HashType) -> Result<String> {
        let path = self.path.clone();
        let hash = tokio::task::spawn_blocking(move || hash_file(&path, ty))
            .await
            .context("Hash task failed")?
            .with_context(|| format!("Failed to hash {}", self.remote))?;
        Ok(hash)
    }

    async fn copy_to(&self, dst: &Path) -> Result<u64> {
        let copied = tokio::fs::copy(&self.path, dst)
            .await
            .with_context(|| format!("Failed to copy {} to {:?}", self.remote, dst))?;
        trace!(remote = %self.remote, bytes = copied, "Copied local object");
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_object() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.txt"), b"hello").unwrap();

        let remote = LocalRemote::new("local", dir.path());
        let obj = remote.new_object("/docs/readme.txt").await.unwrap();

        assert_eq!(obj.remote(), "docs/readme.txt");
        assert_eq!(obj.size(), 5);
        assert_eq!(
            obj.hash(HashType::Md5).await.unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[tokio::test]
    async fn test_new_object_missing_or_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();

        let remote = LocalRemote::new("local", dir.path());
        assert!(remote.new_object("nope.txt").await.is_err());
        assert!(remote.new_object("docs").await.is_err());
    }

    #[tokio::test]
    async fn test_copy_to() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.txt"), b"payload").unwrap();
        let remote = LocalRemote::new("local", dir.path());
        let obj = remote.new_object("src.txt").await.unwrap();

        let dst = dir.path().join("dst.txt");
        std::fs::write(&dst, b"previous longer contents").unwrap();
        assert_eq!(obj.copy_to(&dst).await.unwrap(), 7);
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn test_root_is_slash_separated() {
        let remote = LocalRemote::new("local", "/srv/data");
        assert_eq!(remote.root(), "/srv/data");
        assert_eq!(remote.name(), "local");
        assert!(remote.precision().is_some());
    }
}
