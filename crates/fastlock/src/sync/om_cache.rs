//! Per-thread object -> monitor cache.
//!
//! A direct-mapped cache consulted before the global monitor table. A miss never
//! means "not locked", only that the authoritative lookup has to be done.
//!
//! Entries are never re-validated: the owning thread clears the cache whenever an
//! association may have become stale, i.e. when monitors are deflated or objects move.

use std::{
    fmt,
    mem::{offset_of, size_of},
    ptr::NonNull,
    sync::atomic::{AtomicU64, Ordering},
};

use mmtk::util::ObjectReference;

use crate::options::{
    syncflags_om_cache_hit_rate, syncflags_om_cache_report_interval, syncflags_use_om_cache,
};

use super::object_monitor::ObjectMonitor;

const LOG_CAPACITY: u32 = 3;

#[repr(C)]
pub struct OMCache {
    oops: [Option<ObjectReference>; OMCache::CAPACITY],
    /// Always empty; read by generated code that scans one slot past the keys.
    #[allow(dead_code)]
    null_sentinel: Option<ObjectReference>,
    monitors: [Option<NonNull<ObjectMonitor>>; OMCache::CAPACITY],
}

const _: () = {
    assert!(OMCache::CAPACITY == 1 << LOG_CAPACITY);
    assert!(size_of::<Option<NonNull<ObjectMonitor>>>() == size_of::<usize>());
    assert!(
        OMCache::OOP_TO_MONITOR_DIFFERENCE == (OMCache::CAPACITY + 1) * size_of::<usize>()
    );
};

impl OMCache {
    pub const CAPACITY: usize = 8;

    pub const OOPS_OFFSET: usize = offset_of!(Self, oops);
    pub const MONITORS_OFFSET: usize = offset_of!(Self, monitors);
    /// Distance in bytes between the key slot of an index and its monitor slot.
    pub const OOP_TO_MONITOR_DIFFERENCE: usize = Self::MONITORS_OFFSET - Self::OOPS_OFFSET;

    pub const fn new() -> Self {
        Self {
            oops: [None; Self::CAPACITY],
            null_sentinel: None,
            monitors: [None; Self::CAPACITY],
        }
    }

    /// The only slot `o` can be cached in.
    pub fn slot_index(o: ObjectReference) -> usize {
        let word = (o.to_raw_address().as_usize() as u64) >> 3;
        (word.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - LOG_CAPACITY)) as usize
    }

    pub fn get_monitor(&self, o: ObjectReference) -> Option<NonNull<ObjectMonitor>> {
        if !syncflags_use_om_cache() {
            return None;
        }

        let index = Self::slot_index(o);
        let monitor = if self.oops[index] == Some(o) {
            self.monitors[index]
        } else {
            None
        };

        record_lookup(monitor.is_some());
        monitor
    }

    /// Caches `monitor` for its object, evicting whatever occupied the slot.
    pub fn set_monitor(&mut self, monitor: &ObjectMonitor) {
        if !syncflags_use_om_cache() {
            return;
        }

        let Some(o) = monitor.object() else {
            log::trace!(target: "vmkit::om_cache", "not caching deflated {:?}", monitor);
            return;
        };

        let index = Self::slot_index(o);
        self.oops[index] = Some(o);
        self.monitors[index] = Some(NonNull::from(monitor));
    }

    pub fn clear(&mut self) {
        self.oops.fill(None);
        self.monitors.fill(None);
    }

    pub fn is_empty(&self) -> bool {
        self.oops.iter().all(Option::is_none)
    }
}

impl Default for OMCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OMCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (o, monitor) in self.oops.iter().zip(self.monitors.iter()) {
            if let (Some(o), Some(monitor)) = (o, monitor) {
                map.entry(o, monitor);
            }
        }
        map.finish()
    }
}

static LOOKUPS: AtomicU64 = AtomicU64::new(0);
static HITS: AtomicU64 = AtomicU64::new(0);

/// Process-wide lookup statistics, collected while `om_cache_hit_rate` is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OMCacheStats {
    pub lookups: u64,
    pub hits: u64,
}

impl OMCacheStats {
    pub fn hit_rate(&self) -> Option<f64> {
        (self.lookups != 0).then(|| self.hits as f64 / self.lookups as f64)
    }
}

impl fmt::Display for OMCacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OMCache lookups: {}, hits: {}", self.lookups, self.hits)?;
        if let Some(rate) = self.hit_rate() {
            write!(f, " ({:.2}%)", rate * 100.0)?;
        }
        Ok(())
    }
}

pub fn stats() -> OMCacheStats {
    OMCacheStats {
        lookups: LOOKUPS.load(Ordering::Relaxed),
        hits: HITS.load(Ordering::Relaxed),
    }
}

/// Counts a lookup and returns the statistics that were reported, if this lookup
/// completed a reporting interval.
fn record_lookup(hit: bool) -> Option<OMCacheStats> {
    if !syncflags_om_cache_hit_rate() {
        return None;
    }

    if hit {
        HITS.fetch_add(1, Ordering::Relaxed);
    }
    let lookups = LOOKUPS.fetch_add(1, Ordering::Relaxed) + 1;

    let interval = syncflags_om_cache_report_interval() as u64;
    if interval == 0 || lookups % interval != 0 {
        return None;
    }

    let stats = stats();
    log::info!(target: "vmkit::om_cache", "{}", stats);
    Some(stats)
}
