//! Cache Registry
//!
//! Indexes the cached items of one remote by cleaned remote path and owns
//! the two on-disk trees they live in.
//!
//! Locking: the registry lock guards the item map and the usage total.
//! Each item has its own lock. When both are needed the registry lock is
//! always taken first; the cleaner relies on this to walk the map and lock
//! each item in turn.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cleaner;
use super::errors::CacheError;
use super::eviction::CacheStats;
use super::fingerprint::{Fingerprinter, ObjectSnapshot};
use super::item::Item;
use super::options::CacheOptions;
use super::paths::{self, clean, regular_file, remove_if_exists, staging_file, CacheLayout};
use crate::remote::{common_hash, HashType, Remote, RemoteObject, LOCAL_HASHES};

/// State guarded by the registry lock
pub(crate) struct Registry {
    /// Items by cleaned remote path
    pub(crate) items: HashMap<String, Arc<Item>>,
    /// Total size of all items, recomputed before quota decisions
    pub(crate) used: u64,
}

/// Local disk cache for one remote
pub struct Cache {
    /// Remote being mirrored
    remote: Arc<dyn Remote>,
    /// Cache tunables
    pub(crate) opts: CacheOptions,
    /// Content and metadata roots
    layout: Arc<CacheLayout>,
    /// Fingerprints remote objects using the negotiated hash
    fingerprinter: Fingerprinter,
    /// Item map and usage total
    registry: Mutex<Registry>,
    /// Eviction counters
    pub(crate) stats: CacheStats,
    /// Stops the cleaner; child of the token passed to `new`
    cancel: CancellationToken,
    /// Background cleaner task, if running
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    /// Create the cache for `remote` and start its cleaner
    ///
    /// Makes sure both cache trees exist, drops staging files a crashed
    /// run left behind, loads the rest and removes empty directories. Any
    /// failure here is fatal: the cache must not come up half-loaded.
    ///
    /// The cleaner runs until `cancel` is cancelled, `shutdown` is called
    /// or the cache is dropped.
    pub async fn new(
        remote: Arc<dyn Remote>,
        opts: CacheOptions,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let layout = CacheLayout::for_remote(&opts.cache_dir(), remote.name(), remote.root());
        debug!(root = %layout.root().display(), "vfs cache root");
        debug!(root = %layout.meta_root().display(), "vfs metadata cache root");

        let hash_type = common_hash(LOCAL_HASHES, remote.hashes());
        let fingerprinter = Fingerprinter::new(remote.as_ref(), hash_type);

        let cache = Arc::new(Self {
            remote,
            opts,
            layout: Arc::new(layout),
            fingerprinter,
            registry: Mutex::new(Registry {
                items: HashMap::new(),
                used: 0,
            }),
            stats: CacheStats::default(),
            cancel: cancel.child_token(),
            cleaner: Mutex::new(None),
        });

        // Tree walks stay off the async workers
        let worker = Arc::clone(&cache);
        tokio::task::spawn_blocking(move || -> Result<()> {
            worker
                .layout
                .mkdir("")
                .context("Failed to make cache directory")?;
            worker.remove_leftover_staging_files();
            worker.reload().context("Failed to load cache")?;
            worker.purge_empty_dirs();
            Ok(())
        })
        .await
        .context("Cache load task failed")??;

        let handle = cleaner::spawn(&cache, cache.opts.poll_interval, cache.cancel.clone());
        *cache.cleaner.lock().unwrap_or_else(PoisonError::into_inner) = handle;

        info!(
            remote = cache.remote.name(),
            root = %cache.layout.root().display(),
            items = cache.len(),
            hash = ?hash_type,
            "File cache initialized"
        );

        Ok(cache)
    }

    /// Take the registry lock
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The remote being cached
    pub fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }

    /// Content and metadata roots
    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Hash shared by the cache and the remote
    pub fn hash_type(&self) -> Option<HashType> {
        self.fingerprinter.hash_type()
    }

    /// Fingerprint a remote object
    pub async fn fingerprint(&self, obj: &dyn RemoteObject) -> String {
        self.fingerprinter.fingerprint(obj).await
    }

    /// Get the item for `name`, creating it if needed
    ///
    /// Returns the item and whether it was already in the cache. The item
    /// is created without disk I/O while the registry lock is held.
    pub fn lookup_or_create(&self, name: &str) -> (Arc<Item>, bool) {
        let name = clean(name);
        let mut registry = self.registry();
        match registry.items.entry(name) {
            Entry::Occupied(entry) => (entry.get().clone(), true),
            Entry::Vacant(entry) => {
                let item = Arc::new(Item::new(self.layout.clone(), entry.key()));
                entry.insert(item.clone());
                (item, false)
            }
        }
    }

    /// Get the item for `name`, creating it if needed
    pub fn item(&self, name: &str) -> Arc<Item> {
        self.lookup_or_create(name).0
    }

    /// Put `item` under `name`
    ///
    /// Returns the item it displaced, if that was a different item.
    pub fn put(&self, name: &str, item: Arc<Item>) -> Option<Arc<Item>> {
        let name = clean(name);
        let mut registry = self.registry();
        match registry.items.insert(name, item.clone()) {
            Some(old) if !Arc::ptr_eq(&old, &item) => Some(old),
            _ => None,
        }
    }

    /// Whether the registry has an entry for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.registry().items.contains_key(&clean(name))
    }

    /// Number of items in the registry
    pub fn len(&self) -> usize {
        self.registry().items.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes used as of the last recomputation
    pub fn used(&self) -> u64 {
        self.registry().used
    }

    /// Number of open handles on `name`, 0 if it is not cached
    pub fn opens(&self, name: &str) -> u32 {
        let registry = self.registry();
        match registry.items.get(&clean(name)) {
            Some(item) => item.lock().opens(),
            None => 0,
        }
    }

    /// Whether the content file for `name` is on disk
    ///
    /// Checks the disk directly. Anything but a regular file (directory,
    /// symlink, device) counts as missing.
    pub fn exists(&self, name: &str) -> bool {
        regular_file(&self.layout.to_os_path(&clean(name))).is_some()
    }

    /// Rename a cached file
    ///
    /// The item moves its files first; the registry is only re-keyed once
    /// that succeeded, so a failed move leaves the registry untouched.
    pub fn rename(
        &self,
        name: &str,
        new_name: &str,
        new_obj: Option<Arc<dyn RemoteObject>>,
    ) -> Result<(), CacheError> {
        let name = clean(name);
        let new_name = clean(new_name);

        let item = self.item(&name);
        item.rename(&name, &new_name, new_obj)?;

        {
            let mut registry = self.registry();
            if let Some(item) = registry.items.remove(&name) {
                registry.items.insert(new_name.clone(), item);
            }
        }

        info!(path = %name, new_path = %new_name, "Renamed in cache");
        Ok(())
    }

    /// Drop the cached data for a file deleted on the remote
    pub fn remove(&self, name: &str) {
        let item = self.item(name);
        item.remove("file deleted");
    }

    /// Set the modification time of a cached file
    pub fn set_mod_time(&self, name: &str, mod_time: SystemTime) {
        let item = self.item(name);
        item.set_mod_time(mod_time);
    }

    /// Check the cached copy of `name` is consistent with `obj`
    ///
    /// Stale data is dropped and anything past the object's size is cut
    /// off. Only the truncate can fail.
    pub async fn check(&self, obj: Arc<dyn RemoteObject>, name: &str) -> Result<()> {
        // Remote round trips happen before any lock is taken
        let snapshot = self.fingerprinter.snapshot(obj.as_ref()).await;

        let item = self.item(name);
        tokio::task::spawn_blocking(move || {
            item.check_object(obj, &snapshot);
            item.truncate_to_current_size()
        })
        .await
        .context("Check task failed")?
        .context("Check truncate failed")?;
        Ok(())
    }

    /// Make sure the cached copy of `name` holds the whole of `obj`
    ///
    /// If the cached content is complete and its fingerprint matches the
    /// object nothing is transferred. Otherwise stale data is dropped and
    /// the object is copied into a staging file which then replaces the
    /// content file. Returns whether a transfer happened.
    pub async fn fetch(&self, obj: Arc<dyn RemoteObject>, name: &str) -> Result<bool> {
        let snapshot = self.fingerprinter.snapshot(obj.as_ref()).await;
        let item = self.item(name);

        let staged = {
            let item = Arc::clone(&item);
            let obj = Arc::clone(&obj);
            let layout = Arc::clone(&self.layout);
            tokio::task::spawn_blocking(move || stage(&item, obj, &snapshot, &layout))
                .await
                .context("Fetch task failed")??
        };

        let Some(staged) = staged else {
            debug!(path = %item.name(), "Cached copy is up to date");
            return Ok(false);
        };

        obj.copy_to(&staged)
            .await
            .with_context(|| format!("Failed to fetch {} into the cache", obj.remote()))?;

        tokio::task::spawn_blocking(move || item.install(staged))
            .await
            .context("Fetch task failed")??;
        Ok(true)
    }

    /// Delete the whole cache from disk
    pub fn cleanup(&self) -> Result<(), CacheError> {
        let root = remove_tree(self.layout.root());
        let meta = remove_tree(self.layout.meta_root());
        root.and(meta)
    }

    /// Remove directories left empty in both trees
    pub fn purge_empty_dirs(&self) {
        if let Err(e) = paths::purge_empty_dirs(self.layout.root()) {
            error!(error = %e, "Failed to remove empty directories from cache");
        }
        if let Err(e) = paths::purge_empty_dirs(self.layout.meta_root()) {
            error!(error = %e, "Failed to remove empty directories from metadata cache");
        }
    }

    /// Populate the registry from the files on disk
    ///
    /// Every regular file in either tree gets an item, except staging
    /// files. New items read their state from disk after the registry lock
    /// is released.
    pub fn reload(&self) -> Result<(), CacheError> {
        let mut loaded = Vec::new();
        for root in [self.layout.root(), self.layout.meta_root()] {
            for name in paths::walk_files(root)? {
                if paths::is_temp_name(&name) {
                    continue;
                }
                let (item, found) = self.lookup_or_create(&name);
                if !found {
                    loaded.push(item);
                }
            }
        }

        for item in &loaded {
            item.load();
        }

        debug!(items = loaded.len(), "Reloaded cache from disk");
        Ok(())
    }

    /// Delete staging files a previous run left behind
    fn remove_leftover_staging_files(&self) {
        for root in [self.layout.root(), self.layout.meta_root()] {
            let names = match paths::walk_files(root) {
                Ok(names) => names,
                Err(e) => {
                    warn!(error = %e, "Failed to scan cache for staging files");
                    continue;
                }
            };
            for name in names.iter().filter(|name| paths::is_temp_name(name)) {
                let os_path = root.join(name);
                match remove_if_exists(&os_path) {
                    Ok(_) => debug!(path = %name, "Removed leftover staging file"),
                    Err(e) => warn!(path = %name, error = %e, "Failed to remove staging file"),
                }
            }
        }
    }

    /// Stop the cleaner and wait for it to exit
    ///
    /// A pass in progress runs to completion first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .cleaner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Cache cleaner task failed");
            }
        }
    }

    /// Whether the cleaner task is running
    pub fn cleaner_running(&self) -> bool {
        self.cleaner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

/// Prepare a staging file for `obj`, or `None` if the cached copy is current
fn stage(
    item: &Item,
    obj: Arc<dyn RemoteObject>,
    snapshot: &ObjectSnapshot,
    layout: &CacheLayout,
) -> Result<Option<tempfile::TempPath>, CacheError> {
    if !item.need_transfer(snapshot) {
        return Ok(None);
    }
    item.check_object(obj, snapshot);
    let os_path = layout.mkdir(&item.name())?;
    Ok(Some(staging_file(&os_path)?.into_temp_path()))
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Remove a directory tree, treating a missing tree as success
fn remove_tree(path: &Path) -> Result<(), CacheError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io("remove cache directory", path, e)),
    }
}
