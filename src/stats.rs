use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::index::EntryKind;

/// Run-local cache counters, updated lock-free from compiler threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    stored: AtomicU64,
    store_failures: AtomicU64,
    stored_stubs: AtomicU64,
    stored_blobs: AtomicU64,
    stored_adapters: AtomicU64,
    stored_code: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_store(&self, kind: EntryKind) {
        self.stored.fetch_add(1, Ordering::Relaxed);
        let per_kind = match kind {
            EntryKind::Stub => &self.stored_stubs,
            EntryKind::Adapter => &self.stored_adapters,
            EntryKind::Code => &self.stored_code,
            EntryKind::SharedBlob | EntryKind::Tier1Blob | EntryKind::Tier2Blob => {
                &self.stored_blobs
            }
            EntryKind::None => return,
        };
        per_kind.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: usize) {
        if count > 0 {
            self.invalidations.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            stored: self.stored.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            stored_stubs: self.stored_stubs.load(Ordering::Relaxed),
            stored_blobs: self.stored_blobs.load(Ordering::Relaxed),
            stored_adapters: self.stored_adapters.load(Ordering::Relaxed),
            stored_code: self.stored_code.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub stored: u64,
    pub store_failures: u64,
    pub stored_stubs: u64,
    pub stored_blobs: u64,
    pub stored_adapters: u64,
    pub stored_code: u64,
    pub lookups: u64,
    pub hits: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub invalidations: u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_kind() {
        let stats = CacheStats::new();
        stats.record_store(EntryKind::Stub);
        stats.record_store(EntryKind::Tier2Blob);
        stats.record_store(EntryKind::Code);
        stats.record_store(EntryKind::Code);
        stats.record_lookup(true);
        stats.record_lookup(false);
        stats.record_invalidations(0);
        stats.record_invalidations(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.stored, 4);
        assert_eq!(snapshot.stored_code, 2);
        assert_eq!(snapshot.stored_blobs, 1);
        assert_eq!(snapshot.invalidations, 2);
        assert!((snapshot.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
