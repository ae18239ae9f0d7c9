//! Per-loader bridge to the shared-class provider.
//!
//! Every provider interaction is turned into an outcome value. A miss, an
//! orphan hit (bytes without local metadata) and a provider failure all send
//! the loader down its normal resolution path; nothing here ever fails a
//! class definition.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::metadata::{MetadataRecord, MetadataStore};
use crate::provider::{ProviderFactory, ProviderOwner, SharedClassProvider};

#[derive(Debug)]
pub enum CacheLookup {
    /// Bytes and the metadata recorded for their index.
    Hit {
        bytes: Vec<u8>,
        index: usize,
        metadata: Arc<MetadataRecord>,
    },
    /// The provider had bytes but this loader never recorded metadata for
    /// the index they were stored under.
    Orphan { index: usize },
    Miss,
    Failed(ProviderError),
}

#[derive(Debug)]
pub enum ModuleLookup {
    Hit(Vec<u8>),
    Miss,
    Failed(ProviderError),
}

#[derive(Debug)]
pub enum StoreOutcome {
    Stored,
    Rejected,
    Failed(ProviderError),
    /// Sharing is off for this loader.
    Skipped,
}

#[derive(Debug, Default)]
pub struct BridgeStats {
    hits: AtomicU64,
    orphans: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    stores: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub hits: u64,
    pub orphans: u64,
    pub misses: u64,
    pub failures: u64,
    pub stores: u64,
    pub rejected: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::ops::AddAssign for BridgeStatsSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        self.hits += rhs.hits;
        self.orphans += rhs.orphans;
        self.misses += rhs.misses;
        self.failures += rhs.failures;
        self.stores += rhs.stores;
        self.rejected += rhs.rejected;
    }
}

#[derive(Default)]
pub struct SharedClassBridge {
    provider: OnceLock<Arc<dyn SharedClassProvider>>,
    metadata: OnceLock<MetadataStore>,
    init: Mutex<()>,
    stats: BridgeStats,
}

impl std::fmt::Debug for SharedClassBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedClassBridge")
            .field("attached", &self.is_active())
            .field("metadata", &self.metadata.get())
            .finish()
    }
}

impl SharedClassBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a provider from `factory`. A no-op once attached; leaves the
    /// bridge inert when the factory declines.
    pub fn initialize(
        &self,
        factory: &dyn ProviderFactory,
        owner: ProviderOwner<'_>,
        initial_search_path: &[String],
        boot: bool,
        cache_dir: bool,
    ) {
        let _guard = self.init.lock();
        if self.provider.get().is_some() {
            return;
        }
        let Some(provider) = factory.initialize(owner, initial_search_path, boot, cache_dir)
        else {
            debug!(loader = %owner.id, "no shared class provider; sharing disabled");
            return;
        };
        let _ = self
            .metadata
            .set(MetadataStore::new(initial_search_path.len()));
        let _ = self.provider.set(provider);
    }

    pub fn is_active(&self) -> bool {
        self.provider.get().is_some()
    }

    pub fn has_metadata_store(&self) -> bool {
        self.metadata.get().is_some()
    }

    pub fn metadata(&self) -> Option<&MetadataStore> {
        self.metadata.get()
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    fn attached(&self) -> Option<(&Arc<dyn SharedClassProvider>, &MetadataStore)> {
        Some((self.provider.get()?, self.metadata.get()?))
    }

    pub fn lookup_classpath(&self, class_name: &str) -> CacheLookup {
        let Some((provider, metadata)) = self.attached() else {
            return CacheLookup::Miss;
        };
        match provider.find_by_classpath(class_name) {
            Ok(Some(cached)) => match metadata.get(cached.index) {
                Some(record) => {
                    BridgeStats::bump(&self.stats.hits);
                    CacheLookup::Hit {
                        bytes: cached.bytes,
                        index: cached.index,
                        metadata: record,
                    }
                }
                None => {
                    BridgeStats::bump(&self.stats.orphans);
                    debug!(class_name, index = cached.index, "cached class has no local metadata");
                    CacheLookup::Orphan {
                        index: cached.index,
                    }
                }
            },
            Ok(None) => {
                BridgeStats::bump(&self.stats.misses);
                CacheLookup::Miss
            }
            Err(err) => {
                BridgeStats::bump(&self.stats.failures);
                warn!(class_name, error = %err, "shared class lookup failed");
                CacheLookup::Failed(err)
            }
        }
    }

    /// Records metadata for `index` (first writer wins) and stores the class
    /// bytes under it.
    pub fn store_classpath(
        &self,
        class_name: &str,
        bytes: &[u8],
        index: usize,
        make_metadata: impl FnOnce() -> MetadataRecord,
    ) -> StoreOutcome {
        let Some((provider, metadata)) = self.attached() else {
            return StoreOutcome::Skipped;
        };
        metadata.get_or_insert_with(index, make_metadata);
        self.finish_store(class_name, provider.store_by_classpath(class_name, bytes, index))
    }

    pub fn lookup_url(&self, location: &str, class_name: &str) -> ModuleLookup {
        let Some(provider) = self.provider.get() else {
            return ModuleLookup::Miss;
        };
        match provider.find_by_url(location, class_name) {
            Ok(Some(bytes)) => {
                BridgeStats::bump(&self.stats.hits);
                ModuleLookup::Hit(bytes)
            }
            Ok(None) => {
                BridgeStats::bump(&self.stats.misses);
                ModuleLookup::Miss
            }
            Err(err) => {
                BridgeStats::bump(&self.stats.failures);
                warn!(class_name, location, error = %err, "shared class lookup failed");
                ModuleLookup::Failed(err)
            }
        }
    }

    pub fn store_url(&self, location: &str, class_name: &str, bytes: &[u8]) -> StoreOutcome {
        let Some(provider) = self.provider.get() else {
            return StoreOutcome::Skipped;
        };
        self.finish_store(class_name, provider.store_by_url(location, class_name, bytes))
    }

    pub fn search_path_appended(&self, location: &str) {
        if let Some(provider) = self.provider.get() {
            provider.search_path_appended(location);
        }
    }

    fn finish_store(&self, class_name: &str, result: Result<bool, ProviderError>) -> StoreOutcome {
        match result {
            Ok(true) => {
                BridgeStats::bump(&self.stats.stores);
                StoreOutcome::Stored
            }
            Ok(false) => {
                BridgeStats::bump(&self.stats.rejected);
                StoreOutcome::Rejected
            }
            Err(err) => {
                BridgeStats::bump(&self.stats.failures);
                warn!(class_name, error = %err, "failed to store shared class");
                StoreOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{CodeSource, LoaderId};
    use crate::provider::{ClassStore, MemoryStore, StoreProviderFactory};

    struct Declining;

    impl ProviderFactory for Declining {
        fn initialize(
            &self,
            _owner: ProviderOwner<'_>,
            _search_path: &[String],
            _boot: bool,
            _cache_dir: bool,
        ) -> Option<Arc<dyn SharedClassProvider>> {
            None
        }
    }

    fn owner() -> ProviderOwner<'static> {
        ProviderOwner {
            id: LoaderId::next(),
            name: "test",
        }
    }

    fn record() -> MetadataRecord {
        MetadataRecord {
            code_source: CodeSource::new("file:/a/", Vec::new()),
            manifest: None,
        }
    }

    #[test]
    fn declined_provider_leaves_bridge_inert() {
        let bridge = SharedClassBridge::new();
        bridge.initialize(&Declining, owner(), &["file:/a/".into()], false, false);
        assert!(!bridge.is_active());
        assert!(!bridge.has_metadata_store());
        assert!(matches!(bridge.lookup_classpath("a.A"), CacheLookup::Miss));
        assert!(matches!(
            bridge.store_classpath("a.A", b"x", 0, record),
            StoreOutcome::Skipped
        ));
    }

    #[test]
    fn second_initialize_keeps_first_provider() {
        let store: Arc<dyn ClassStore> = Arc::new(MemoryStore::new());
        let factory = StoreProviderFactory::new(store);
        let bridge = SharedClassBridge::new();
        bridge.initialize(&factory, owner(), &["file:/a/".into()], false, false);
        bridge.store_classpath("a.A", b"x", 0, record);
        bridge.initialize(&factory, owner(), &[], false, false);
        assert_eq!(bridge.metadata().unwrap().capacity(), 1);
        assert!(matches!(bridge.lookup_classpath("a.A"), CacheLookup::Hit { index: 0, .. }));
    }

    #[test]
    fn hit_without_metadata_is_orphan() {
        let store: Arc<dyn ClassStore> = Arc::new(MemoryStore::new());
        let factory = StoreProviderFactory::new(Arc::clone(&store));
        let path = vec!["file:/a/".to_string()];

        let writer = SharedClassBridge::new();
        writer.initialize(&factory, owner(), &path, false, false);
        writer.store_classpath("a.A", b"x", 0, record);

        let reader = SharedClassBridge::new();
        reader.initialize(&factory, owner(), &path, false, false);
        assert!(matches!(reader.lookup_classpath("a.A"), CacheLookup::Orphan { index: 0 }));
        assert_eq!(reader.stats().orphans, 1);
    }
}
