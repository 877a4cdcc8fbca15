//! Cache Eviction
//!
//! Two sweeps keep the cache within bounds: one drops items not accessed
//! for longer than a maximum age, the other drops the least recently
//! accessed items until usage is back within the quota. Both hold the
//! registry lock for their whole run and skip items with open handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info};

use super::item::Item;
use super::registry::{Cache, Registry};

/// Running eviction counters
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Completed cleaning passes
    passes: AtomicU64,
    /// Items evicted by sweeps
    evicted_items: AtomicU64,
    /// Bytes evicted by sweeps
    evicted_bytes: AtomicU64,
}

impl CacheStats {
    fn record_sweep(&self, report: &SweepReport) {
        self.evicted_items
            .fetch_add(report.evicted_items as u64, Ordering::Relaxed);
        self.evicted_bytes
            .fetch_add(report.evicted_bytes, Ordering::Relaxed);
    }

    /// Returns (passes, evicted items, evicted bytes)
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.passes.load(Ordering::Relaxed),
            self.evicted_items.load(Ordering::Relaxed),
            self.evicted_bytes.load(Ordering::Relaxed),
        )
    }
}

/// Outcome of one sweep or cleaning pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub items_before: usize,
    pub items_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub evicted_items: usize,
    pub evicted_bytes: u64,
}

impl Cache {
    /// Eviction counters: (passes, evicted items, evicted bytes)
    pub fn stats(&self) -> (u64, u64, u64) {
        self.stats.snapshot()
    }

    /// Recompute the usage total from the items
    pub fn update_used(&self) -> u64 {
        let mut registry = self.registry();
        update_used_locked(&mut registry)
    }

    /// Evict unopened items last accessed more than `max_age` ago
    pub fn purge_old(&self, max_age: Duration) -> SweepReport {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut registry = self.registry();
        let mut report = SweepReport {
            items_before: registry.items.len(),
            ..SweepReport::default()
        };

        registry.items.retain(|_, item| {
            let mut state = item.lock();
            item.load_locked(&mut state);
            let size = state.size();
            report.bytes_before += size;

            if state.opens() == 0 && state.atime() < cutoff {
                item.remove_locked(&mut state, "too old");
                report.evicted_items += 1;
                report.evicted_bytes += size;
                false
            } else {
                true
            }
        });

        report.items_after = registry.items.len();
        report.bytes_after = report.bytes_before - report.evicted_bytes;
        registry.used = report.bytes_after;

        self.stats.record_sweep(&report);
        debug!(
            evicted = report.evicted_items,
            bytes = report.evicted_bytes,
            max_age_secs = max_age.as_secs(),
            "Age sweep finished"
        );
        report
    }

    /// Evict unopened items, oldest access first, until usage is within `quota`
    ///
    /// A quota of 0 disables the sweep. Open items still count towards
    /// usage but are never evicted, so the quota may stay exceeded.
    pub fn purge_over_quota(&self, quota: u64) -> SweepReport {
        let mut registry = self.registry();
        let used = update_used_locked(&mut registry);

        let mut report = SweepReport {
            items_before: registry.items.len(),
            bytes_before: used,
            ..SweepReport::default()
        };

        if quota > 0 && used > quota {
            let candidates = oldest_first(&registry);

            for (name, item) in candidates {
                if registry.used <= quota {
                    break;
                }
                let mut state = item.lock();
                if state.opens() > 0 {
                    continue;
                }
                let size = state.size();
                registry.used = registry.used.saturating_sub(size);
                item.remove_locked(&mut state, "over quota");
                registry.items.remove(&name);

                report.evicted_items += 1;
                report.evicted_bytes += size;
            }

            debug!(
                evicted = report.evicted_items,
                bytes = report.evicted_bytes,
                quota = quota,
                used = registry.used,
                "Quota sweep finished"
            );
        }

        report.items_after = registry.items.len();
        report.bytes_after = registry.used;
        self.stats.record_sweep(&report);
        report
    }

    /// Run one cleaning pass: age sweep, then quota sweep
    ///
    /// Returns `None` if the cache root is gone (nothing to clean).
    pub fn clean(&self) -> Option<SweepReport> {
        if !self.layout().root().exists() {
            return None;
        }

        let (old_items, old_used) = {
            let registry = self.registry();
            (registry.items.len(), registry.used)
        };

        let aged = self.purge_old(self.opts.max_age);
        let quota = self.purge_over_quota(self.opts.max_size);

        let (new_items, new_used) = {
            let registry = self.registry();
            (registry.items.len(), registry.used)
        };
        self.stats.passes.fetch_add(1, Ordering::Relaxed);

        info!(
            objects = new_items,
            was_objects = old_items,
            size = new_used,
            was_size = old_used,
            "Cleaned the cache"
        );

        Some(SweepReport {
            items_before: old_items,
            items_after: new_items,
            bytes_before: old_used,
            bytes_after: new_used,
            evicted_items: aged.evicted_items + quota.evicted_items,
            evicted_bytes: aged.evicted_bytes + quota.evicted_bytes,
        })
    }
}

/// Sum the sizes of all items into `used`
fn update_used_locked(registry: &mut Registry) -> u64 {
    let mut used = 0;
    for item in registry.items.values() {
        let mut state = item.lock();
        item.load_locked(&mut state);
        used += state.size();
    }
    registry.used = used;
    used
}

/// Unopened items keyed by name, least recently accessed first
///
/// Access times are read once, so the order is fixed for this snapshot.
fn oldest_first(registry: &Registry) -> Vec<(String, Arc<Item>)> {
    let mut candidates: Vec<(SystemTime, String, Arc<Item>)> = registry
        .items
        .iter()
        .filter_map(|(name, item)| {
            let state = item.lock();
            (state.opens() == 0).then(|| (state.atime(), name.clone(), item.clone()))
        })
        .collect();
    candidates.sort_by_key(|(atime, _, _)| *atime);
    candidates
        .into_iter()
        .map(|(_, name, item)| (name, item))
        .collect()
}
