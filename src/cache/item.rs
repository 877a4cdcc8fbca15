//! Cache Items
//!
//! One `Item` per cached remote file. It tracks the cached size, the last
//! access time and the number of open handles, and owns the content and
//! metadata files for its name. All mutable state sits behind the item's
//! own mutex; when the registry lock is also needed it is taken first.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tracing::{debug, info, warn};

use super::errors::CacheError;
use super::fingerprint::ObjectSnapshot;
use super::paths::{
    self, clean, create_dir_private, regular_file, remove_if_exists, staging_file, CacheLayout,
};
use crate::remote::RemoteObject;

/// Persistent part of an item, stored as JSON in the metadata tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInfo {
    /// Modification time of the remote object, if known
    pub mod_time: Option<SystemTime>,
    /// Last access time
    pub a_time: SystemTime,
    /// Size of the file in bytes
    pub size: u64,
    /// Fingerprint of the remote object the data came from
    pub fingerprint: String,
}

impl ItemInfo {
    fn new(now: SystemTime) -> Self {
        Self {
            mod_time: None,
            a_time: now,
            size: 0,
            fingerprint: String::new(),
        }
    }
}

/// Mutable state of an item, guarded by the item lock
pub struct ItemState {
    /// Cleaned remote name
    name: String,
    /// Persistent fields
    info: ItemInfo,
    /// Number of open handles
    opens: u32,
    /// Whether `info` has been read from disk
    loaded: bool,
    /// Remote object last checked against
    object: Option<Arc<dyn RemoteObject>>,
}

impl ItemState {
    /// Cleaned remote name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached size in bytes
    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Last access time
    pub fn atime(&self) -> SystemTime {
        self.info.a_time
    }

    /// Number of open handles
    pub fn opens(&self) -> u32 {
        self.opens
    }

    /// Recorded fingerprint, empty if never checked
    pub fn fingerprint(&self) -> &str {
        &self.info.fingerprint
    }

    #[cfg(test)]
    pub(crate) fn set_atime(&mut self, a_time: SystemTime) {
        self.loaded = true;
        self.info.a_time = a_time;
    }

    #[cfg(test)]
    pub(crate) fn set_size(&mut self, size: u64) {
        self.loaded = true;
        self.info.size = size;
    }
}

/// A cached remote file
pub struct Item {
    layout: Arc<CacheLayout>,
    state: Mutex<ItemState>,
}

impl Item {
    /// Create an item for `name` without touching the disk
    ///
    /// The on-disk state is read by `load`, either during reload or on
    /// first use.
    pub(crate) fn new(layout: Arc<CacheLayout>, name: &str) -> Self {
        Self {
            layout,
            state: Mutex::new(ItemState {
                name: clean(name),
                info: ItemInfo::new(SystemTime::now()),
                opens: 0,
                loaded: false,
                object: None,
            }),
        }
    }

    /// Take the item lock
    pub fn lock(&self) -> MutexGuard<'_, ItemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cleaned remote name
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Cached size in bytes
    pub fn size(&self) -> u64 {
        let mut state = self.lock();
        self.load_locked(&mut state);
        state.info.size
    }

    /// Last access time
    pub fn atime(&self) -> SystemTime {
        let mut state = self.lock();
        self.load_locked(&mut state);
        state.info.a_time
    }

    /// Number of open handles
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    /// Remote object last checked against or renamed to
    pub fn object(&self) -> Option<Arc<dyn RemoteObject>> {
        self.lock().object.clone()
    }

    /// Whether the content file is on disk
    pub fn present(&self) -> bool {
        let state = self.lock();
        regular_file(&self.layout.to_os_path(&state.name)).is_some()
    }

    /// Read size, access time and fingerprint from disk
    pub fn load(&self) {
        let mut state = self.lock();
        self.load_locked(&mut state);
    }

    /// Load with the item lock already held
    pub(crate) fn load_locked(&self, state: &mut ItemState) {
        if state.loaded {
            return;
        }
        state.loaded = true;

        let os_path = self.layout.to_os_path(&state.name);
        let Some(content) = regular_file(&os_path) else {
            // Nothing cached; metadata without data is meaningless
            state.info.size = 0;
            state.info.fingerprint.clear();
            return;
        };

        match read_info(&self.layout.to_os_path_meta(&state.name)) {
            Ok(Some(info)) => state.info = info,
            Ok(None) => {
                state.info.size = content.len();
                if let Ok(modified) = content.modified() {
                    state.info.a_time = modified;
                }
            }
            Err(e) => {
                warn!(path = %state.name, error = %e, "Ignoring unreadable item metadata");
                state.info.size = content.len();
            }
        }
    }

    /// Pin the item and make sure its content file exists
    ///
    /// Returns the content path for the caller to read and write.
    pub fn open(&self) -> Result<PathBuf, CacheError> {
        let mut state = self.lock();
        self.load_locked(&mut state);

        let os_path = self.layout.mkdir(&state.name)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .open(&os_path)
            .map_err(|e| CacheError::io("open cache file", &os_path, e))?;

        state.opens += 1;
        state.info.a_time = SystemTime::now();
        debug!(path = %state.name, opens = state.opens, "Opened cache item");

        log_err(&state.name, "save item metadata", self.save_locked(&state));
        Ok(os_path)
    }

    /// Release one open handle
    pub fn close(&self) -> Result<(), CacheError> {
        let mut state = self.lock();
        if state.opens == 0 {
            return Err(CacheError::NotOpen(state.name.clone()));
        }
        state.opens -= 1;
        state.info.a_time = SystemTime::now();

        if let Ok(metadata) = fs::metadata(self.layout.to_os_path(&state.name)) {
            state.info.size = metadata.len();
        }
        debug!(path = %state.name, opens = state.opens, size = state.info.size, "Closed cache item");

        log_err(&state.name, "save item metadata", self.save_locked(&state));
        Ok(())
    }

    /// Record an access
    pub fn touch(&self) {
        let mut state = self.lock();
        self.load_locked(&mut state);
        state.info.a_time = SystemTime::now();
    }

    /// Reconcile the cached data with a remote object
    ///
    /// If the object's fingerprint differs from the recorded one the
    /// cached data is stale: it is removed and the object's size, modtime
    /// and fingerprint are recorded instead.
    pub fn check_object(&self, obj: Arc<dyn RemoteObject>, snapshot: &ObjectSnapshot) {
        let fingerprint = snapshot.fingerprint();
        let mut state = self.lock();
        self.load_locked(&mut state);

        if state.info.fingerprint == fingerprint {
            debug!(path = %state.name, "Cached data matches remote object");
        } else {
            if !state.info.fingerprint.is_empty() {
                debug!(
                    path = %state.name,
                    cached = %state.info.fingerprint,
                    remote = %fingerprint,
                    "Remote object changed, dropping cached data"
                );
            }
            self.remove_locked(&mut state, "stale");
            state.info.size = snapshot.size;
            state.info.mod_time = snapshot.mod_time;
            state.info.fingerprint = fingerprint;
        }
        state.object = Some(obj);

        log_err(&state.name, "save item metadata", self.save_locked(&state));
    }

    /// Whether the cached content must be fetched again to match `snapshot`
    ///
    /// Nothing needs transferring when a complete content file is on disk
    /// and its recorded fingerprint is the object's.
    pub fn need_transfer(&self, snapshot: &ObjectSnapshot) -> bool {
        let mut state = self.lock();
        self.load_locked(&mut state);

        let cached_len = regular_file(&self.layout.to_os_path(&state.name)).map(|m| m.len());
        cached_len != Some(snapshot.size) || state.info.fingerprint != snapshot.fingerprint()
    }

    /// Move a fully written staging file into place as the cached content
    ///
    /// Returns the size of the installed file.
    pub(crate) fn install(&self, staged: TempPath) -> Result<u64, CacheError> {
        let mut state = self.lock();
        self.load_locked(&mut state);

        let os_path = self.layout.mkdir(&state.name)?;
        staged
            .persist(&os_path)
            .map_err(|e| CacheError::io("install cache file", &os_path, e.error))?;
        let size = fs::metadata(&os_path)
            .map_err(|e| CacheError::io("stat cache file", &os_path, e))?
            .len();

        state.info.size = size;
        state.info.a_time = SystemTime::now();
        info!(path = %state.name, size = size, "Fetched into cache");

        log_err(&state.name, "save item metadata", self.save_locked(&state));
        Ok(size)
    }

    /// Cut cached content beyond the known size
    pub fn truncate_to_current_size(&self) -> Result<(), CacheError> {
        let mut state = self.lock();
        self.load_locked(&mut state);

        let os_path = self.layout.to_os_path(&state.name);
        let len = match fs::metadata(&os_path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::io("stat cache file", &os_path, e)),
        };
        if len <= state.info.size {
            return Ok(());
        }

        OpenOptions::new()
            .write(true)
            .open(&os_path)
            .and_then(|file| file.set_len(state.info.size))
            .map_err(|e| CacheError::io("truncate cache file", &os_path, e))?;

        debug!(path = %state.name, from = len, to = state.info.size, "Truncated cache file");
        Ok(())
    }

    /// Move the content and metadata files to a new name
    pub fn rename(
        &self,
        name: &str,
        new_name: &str,
        new_obj: Option<Arc<dyn RemoteObject>>,
    ) -> Result<(), CacheError> {
        let name = clean(name);
        let new_name = clean(new_name);
        let mut state = self.lock();

        let os_path = self.layout.to_os_path(&name);
        let new_os_path = self.layout.to_os_path(&new_name);
        paths::rename(&os_path, &new_os_path)?;

        let meta_path = self.layout.to_os_path_meta(&name);
        let new_meta_path = self.layout.to_os_path_meta(&new_name);
        if let Err(e) = paths::rename(&meta_path, &new_meta_path) {
            // Put the content back so the files stay paired
            log_err(&name, "restore cache file", paths::rename(&new_os_path, &os_path));
            return Err(e);
        }

        state.name = new_name;
        state.object = new_obj;
        Ok(())
    }

    /// Delete the cached files
    pub fn remove(&self, reason: &str) -> bool {
        let mut state = self.lock();
        self.remove_locked(&mut state, reason)
    }

    /// Delete the cached files with the item lock already held
    ///
    /// Missing files are not an error; other failures are logged. Returns
    /// whether anything was removed.
    pub fn remove_locked(&self, state: &mut ItemState, reason: &str) -> bool {
        let mut removed = false;

        let os_path = self.layout.to_os_path(&state.name);
        match remove_if_exists(&os_path) {
            Ok(r) => removed |= r,
            Err(e) => warn!(path = %state.name, error = %e, "Failed to remove cache file"),
        }

        let meta_path = self.layout.to_os_path_meta(&state.name);
        match remove_if_exists(&meta_path) {
            Ok(r) => removed |= r,
            Err(e) => warn!(path = %state.name, error = %e, "Failed to remove cache metadata"),
        }

        state.info.size = 0;
        state.info.fingerprint.clear();

        if removed {
            info!(path = %state.name, reason = reason, opens = state.opens, "Removed cached file");
        }
        removed
    }

    /// Set the modification time of the cached file
    pub fn set_mod_time(&self, mod_time: SystemTime) {
        let mut state = self.lock();
        self.load_locked(&mut state);
        state.info.mod_time = Some(mod_time);

        let os_path = self.layout.to_os_path(&state.name);
        if os_path.is_file() {
            let result = OpenOptions::new()
                .write(true)
                .open(&os_path)
                .and_then(|file| file.set_modified(mod_time))
                .map_err(|e| CacheError::io("set modification time", &os_path, e));
            log_err(&state.name, "set modification time", result);
            log_err(&state.name, "save item metadata", self.save_locked(&state));
        }
    }

    /// Write the metadata document atomically
    fn save_locked(&self, state: &ItemState) -> Result<(), CacheError> {
        let meta_path = self.layout.to_os_path_meta(&state.name);
        let parent = meta_path.parent().unwrap_or(self.layout.meta_root());
        create_dir_private(parent).map_err(|e| CacheError::io("make cache meta directory", parent, e))?;

        let data = serde_json::to_vec(&state.info)
            .map_err(|e| CacheError::io("encode item metadata", &meta_path, e.into()))?;

        let mut tmp = staging_file(&meta_path)?;
        tmp.write_all(&data)
            .map_err(|e| CacheError::io("write item metadata", tmp.path().to_path_buf(), e))?;
        tmp.persist(&meta_path)
            .map_err(|e| CacheError::io("persist item metadata", &meta_path, e.error))?;
        Ok(())
    }
}

/// Read a metadata document, `None` if there is none
fn read_info(meta_path: &Path) -> Result<Option<ItemInfo>, CacheError> {
    let data = match fs::read(meta_path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io("read item metadata", meta_path, e)),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| CacheError::io("parse item metadata", meta_path, e.into()))
}

/// Log a failed best-effort step and carry on
pub(crate) fn log_err<T>(name: &str, what: &str, result: Result<T, CacheError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %name, error = %e, "Failed to {}", what);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::tests::FakeObject;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<CacheLayout>) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(CacheLayout::new(dir.path().join("vfs"), dir.path().join("meta")));
        (dir, layout)
    }

    fn write_content(layout: &CacheLayout, name: &str, data: &[u8]) {
        let path = layout.mkdir(name).unwrap();
        fs::write(path, data).unwrap();
    }

    fn snapshot(size: u64, hash: &str) -> ObjectSnapshot {
        ObjectSnapshot {
            size,
            mod_time: None,
            hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn test_new_item_is_pure() {
        let (dir, layout) = setup();
        let item = Item::new(layout, "/a/b.txt");
        assert_eq!(item.name(), "a/b.txt");
        assert_eq!(item.opens(), 0);
        assert!(!dir.path().join("vfs").exists());
    }

    #[test]
    fn test_open_close_counts() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a/b.txt");

        let path = item.open().unwrap();
        assert!(path.is_file());
        item.open().unwrap();
        assert_eq!(item.opens(), 2);

        fs::write(&path, b"12345").unwrap();
        item.close().unwrap();
        item.close().unwrap();
        assert_eq!(item.opens(), 0);
        assert_eq!(item.size(), 5);
        assert!(layout.to_os_path_meta("a/b.txt").is_file());

        assert!(matches!(item.close(), Err(CacheError::NotOpen(_))));
    }

    #[test]
    fn test_load_from_disk() {
        let (_dir, layout) = setup();
        write_content(&layout, "x.bin", &[0u8; 10]);

        let item = Item::new(layout, "x.bin");
        item.load();
        assert_eq!(item.size(), 10);
        assert!(item.present());
    }

    #[test]
    fn test_metadata_survives_reload() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "doc.txt");
        item.open().unwrap();
        item.close().unwrap();
        let atime = item.atime();

        let reloaded = Item::new(layout, "doc.txt");
        reloaded.load();
        assert_eq!(reloaded.atime(), atime);
    }

    #[test]
    fn test_load_without_content_is_empty() {
        let (_dir, layout) = setup();
        let item = Item::new(layout, "missing.txt");
        assert_eq!(item.size(), 0);
        assert!(!item.present());
    }

    #[test]
    fn test_check_object_records_fingerprint() {
        let (_dir, layout) = setup();
        let item = Item::new(layout, "a.txt");
        let obj = Arc::new(FakeObject::new("a.txt", 5));

        item.check_object(obj, &snapshot(5, "h1"));
        let state = item.lock();
        assert_eq!(state.fingerprint(), "5,h1");
        assert_eq!(state.size(), 5);
        drop(state);
        assert!(item.object().is_some());
    }

    #[test]
    fn test_check_object_keeps_fresh_data() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        let obj = Arc::new(FakeObject::new("a.txt", 5));

        item.check_object(obj.clone(), &snapshot(5, "h1"));
        write_content(&layout, "a.txt", b"hello");
        item.check_object(obj, &snapshot(5, "h1"));

        assert!(item.present());
        assert_eq!(fs::read(layout.to_os_path("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_check_object_drops_stale_data() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        let obj = Arc::new(FakeObject::new("a.txt", 5));

        item.check_object(obj.clone(), &snapshot(5, "h1"));
        write_content(&layout, "a.txt", b"hello");
        item.check_object(obj, &snapshot(8, "h2"));

        assert!(!item.present());
        let state = item.lock();
        assert_eq!(state.fingerprint(), "8,h2");
        assert_eq!(state.size(), 8);
    }

    #[test]
    fn test_truncate_to_current_size() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        item.check_object(Arc::new(FakeObject::new("a.txt", 3)), &snapshot(3, "h"));
        write_content(&layout, "a.txt", b"hello");

        item.truncate_to_current_size().unwrap();
        assert_eq!(fs::read(layout.to_os_path("a.txt")).unwrap(), b"hel");

        // Missing file is fine
        let other = Item::new(layout, "none.txt");
        assert!(other.truncate_to_current_size().is_ok());
    }

    #[test]
    fn test_rename_moves_files() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        item.open().unwrap();
        item.close().unwrap();

        item.rename("a.txt", "dir/b.txt", None).unwrap();
        assert_eq!(item.name(), "dir/b.txt");
        assert!(!layout.to_os_path("a.txt").exists());
        assert!(layout.to_os_path("dir/b.txt").is_file());
        assert!(layout.to_os_path_meta("dir/b.txt").is_file());
    }

    #[test]
    fn test_rename_missing_source() {
        let (_dir, layout) = setup();
        let item = Item::new(layout, "ghost.txt");
        assert!(item.rename("ghost.txt", "spirit.txt", None).is_ok());
        assert_eq!(item.name(), "spirit.txt");
    }

    #[test]
    fn test_remove_deletes_files() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        item.open().unwrap();
        item.close().unwrap();

        assert!(item.remove("file deleted"));
        assert!(!layout.to_os_path("a.txt").exists());
        assert!(!layout.to_os_path_meta("a.txt").exists());
        assert_eq!(item.size(), 0);

        // Nothing left to remove
        assert!(!item.remove("file deleted"));
    }

    #[test]
    fn test_set_mod_time() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        item.open().unwrap();
        item.close().unwrap();

        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        item.set_mod_time(when);

        let modified = fs::metadata(layout.to_os_path("a.txt")).unwrap().modified().unwrap();
        assert_eq!(modified, when);
        let info = read_info(&layout.to_os_path_meta("a.txt")).unwrap().unwrap();
        assert_eq!(info.mod_time, Some(when));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_content_is_not_present() {
        let (dir, layout) = setup();
        let target = dir.path().join("elsewhere.txt");
        fs::write(&target, b"outside").unwrap();
        let link = layout.mkdir("link.txt").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let item = Item::new(layout, "link.txt");
        assert!(!item.present());
        assert_eq!(item.size(), 0);
    }

    #[test]
    fn test_need_transfer() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a.txt");
        let obj = Arc::new(FakeObject::new("a.txt", 5));
        let snap = snapshot(5, "h1");

        // Nothing cached yet
        assert!(item.need_transfer(&snap));

        // Fingerprint recorded but no data
        item.check_object(obj, &snap);
        assert!(item.need_transfer(&snap));

        // Partial data
        write_content(&layout, "a.txt", b"hel");
        assert!(item.need_transfer(&snap));

        write_content(&layout, "a.txt", b"hello");
        assert!(!item.need_transfer(&snap));
        assert!(item.need_transfer(&snapshot(5, "h2")));
    }

    #[test]
    fn test_install_moves_staged_file() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "d/a.txt");
        write_content(&layout, "d/a.txt", b"old contents");

        let target = layout.to_os_path("d/a.txt");
        let mut staged = staging_file(&target).unwrap();
        staged.write_all(b"new").unwrap();
        let size = item.install(staged.into_temp_path()).unwrap();

        assert_eq!(size, 3);
        assert_eq!(item.size(), 3);
        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert_eq!(paths::walk_files(layout.root()).unwrap(), vec!["d/a.txt".to_string()]);
    }

    #[test]
    fn test_save_leaves_no_staging_files() {
        let (_dir, layout) = setup();
        let item = Item::new(layout.clone(), "a/b.txt");
        item.open().unwrap();
        item.close().unwrap();

        let names = paths::walk_files(layout.meta_root()).unwrap();
        assert_eq!(names, vec!["a/b.txt".to_string()]);
    }
}
