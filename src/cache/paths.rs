//! Cache Path Layout
//!
//! Maps remote names onto two parallel trees on local disk, one for file
//! content and one for item metadata. Both mirror the remote directory
//! structure file-for-file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::errors::CacheError;

/// Index key of the remote root
pub const ROOT_KEY: &str = "";

/// Normalize a remote name for use as an index key
///
/// Leading/trailing slashes and empty or `.` segments are dropped. `..`
/// pops the previous segment and is discarded at the root, so a key can
/// never address anything outside the cache trees.
pub fn clean(name: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// Split the parent off a cleaned name
fn split_parent(name: &str) -> (&str, &str) {
    match name.rsplit_once('/') {
        Some((parent, leaf)) => (parent, leaf),
        None => (ROOT_KEY, name),
    }
}

/// Path segments of a remote root, with path hazards removed
///
/// On Windows the `\\?` long-path prefix is stripped and drive colons are
/// dropped so the result is usable as ordinary directory names.
fn root_segments(root: &str, windows: bool) -> Vec<String> {
    let mut root = root.to_string();
    if windows {
        root = root.replace('\\', "/");
        if let Some(rest) = root.strip_prefix("//?") {
            root = rest.to_string();
        }
        root = root.replace(':', "");
    }
    root.split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(str::to_string)
        .collect()
}

/// Append the segments of a cleaned name to a base directory
fn join_name(base: &Path, name: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for segment in clean(name).split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

/// Create a directory and its parents, owner access only
///
/// An already existing directory is not an error.
pub(crate) fn create_dir_private(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

/// Remove a file, treating a missing file as success
///
/// Returns whether anything was removed.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Metadata of `path` if it is a regular file
///
/// Symlinks are not followed: a link in the cache tree is never cached data.
pub(crate) fn regular_file(path: &Path) -> Option<fs::Metadata> {
    fs::symlink_metadata(path)
        .ok()
        .filter(|metadata| metadata.file_type().is_file())
}

/// Name prefix of staging files written next to their target
pub(crate) const TEMP_PREFIX: &str = ".tmp";

/// Whether the last segment of a cleaned name is a staging file
pub(crate) fn is_temp_name(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|leaf| leaf.starts_with(TEMP_PREFIX))
}

/// Create an empty staging file in the directory of `target`
///
/// The file is deleted on drop unless it is persisted first.
pub(crate) fn staging_file(target: &Path) -> Result<tempfile::NamedTempFile, CacheError> {
    let dir = target.parent().unwrap_or(target);
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| CacheError::io("create staging file", dir, e))
}

/// Location of the content and metadata trees for one remote
#[derive(Debug, Clone)]
pub struct CacheLayout {
    /// Root of the cached file content
    root: PathBuf,
    /// Root of the cached item metadata
    meta_root: PathBuf,
}

impl CacheLayout {
    /// Use explicit roots for content and metadata
    pub fn new(root: PathBuf, meta_root: PathBuf) -> Self {
        Self { root, meta_root }
    }

    /// Derive the trees for a remote under a system cache directory
    ///
    /// Content lives in `<cache_dir>/vfs/<remote name>/<remote root>` and
    /// metadata in `<cache_dir>/vfsMeta/<remote name>/<remote root>`.
    pub fn for_remote(cache_dir: &Path, remote_name: &str, remote_root: &str) -> Self {
        let segments = root_segments(remote_root, cfg!(windows));

        let mut root = cache_dir.join("vfs").join(remote_name);
        let mut meta_root = cache_dir.join("vfsMeta").join(remote_name);
        for segment in &segments {
            root.push(segment);
            meta_root.push(segment);
        }

        debug!(root = %root.display(), meta_root = %meta_root.display(), "Cache layout");
        Self { root, meta_root }
    }

    /// Root of the content tree
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the metadata tree
    pub fn meta_root(&self) -> &Path {
        &self.meta_root
    }

    /// Content path for a remote name
    pub fn to_os_path(&self, name: &str) -> PathBuf {
        join_name(&self.root, name)
    }

    /// Metadata path for a remote name
    pub fn to_os_path_meta(&self, name: &str) -> PathBuf {
        join_name(&self.meta_root, name)
    }

    /// Create the parent directory of `name` in both trees
    ///
    /// Returns the content path for `name`. Safe to call concurrently for
    /// siblings; existing directories are left alone.
    pub fn mkdir(&self, name: &str) -> Result<PathBuf, CacheError> {
        let name = clean(name);
        let (parent, leaf) = split_parent(&name);

        let parent_path = self.to_os_path(parent);
        create_dir_private(&parent_path)
            .map_err(|e| CacheError::io("make cache directory", &parent_path, e))?;

        let parent_path_meta = self.to_os_path_meta(parent);
        create_dir_private(&parent_path_meta)
            .map_err(|e| CacheError::io("make cache meta directory", &parent_path_meta, e))?;

        if leaf.is_empty() {
            Ok(parent_path)
        } else {
            Ok(parent_path.join(leaf))
        }
    }
}

/// Move a cached file, tolerating earlier partial failures
///
/// A missing source is a no-op. The source must be a regular file, and so
/// must the destination if it exists. When both already name the same file
/// nothing is moved. Missing destination parents are created.
pub fn rename(old_path: &Path, new_path: &Path) -> Result<(), CacheError> {
    let source = match fs::metadata(old_path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CacheError::io("stat source", old_path, e)),
    };
    if !source.is_file() {
        return Err(CacheError::NonRegularSource(old_path.to_path_buf()));
    }

    match fs::metadata(new_path) {
        Ok(dest) => {
            if !dest.is_file() {
                return Err(CacheError::NonRegularDestination(new_path.to_path_buf()));
            }
            if same_file(old_path, new_path, &source, &dest) {
                return Ok(());
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = new_path.parent() {
                create_dir_private(parent)
                    .map_err(|e| CacheError::io("create parent dir", parent, e))?;
            }
        }
        Err(e) => return Err(CacheError::io("stat destination", new_path, e)),
    }

    fs::rename(old_path, new_path).map_err(|e| CacheError::io("rename in cache", old_path, e))
}

#[cfg(unix)]
fn same_file(_a: &Path, _b: &Path, a_meta: &fs::Metadata, b_meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a_meta.dev() == b_meta.dev() && a_meta.ino() == b_meta.ino()
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path, _a_meta: &fs::Metadata, _b_meta: &fs::Metadata) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Relative, slash separated names of every regular file under `dir`
///
/// Directories, symlinks and other special files are skipped.
pub fn walk_files(dir: &Path) -> Result<Vec<String>, CacheError> {
    let mut names = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            CacheError::io("walk cache", path, io::Error::from(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        names.push(name);
    }
    Ok(names)
}

/// Remove empty directories below `dir`, leaving `dir` itself
///
/// Children are visited before their parents, so a directory emptied by
/// this pass is removed as well. Returns the number of directories removed.
pub fn purge_empty_dirs(dir: &Path) -> Result<usize, CacheError> {
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            CacheError::io("walk cache", path, io::Error::from(e))
        })?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        let is_empty = fs::read_dir(path)
            .map_err(|e| CacheError::io("read directory", path, e))?
            .next()
            .is_none();
        if !is_empty {
            continue;
        }
        match fs::remove_dir(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed empty cache directory");
                removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove empty cache directory");
            }
        }
    }
    Ok(removed)
}
