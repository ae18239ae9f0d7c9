//! Class cache for deserialization.
//!
//! Maps (class name, initiating loader) to a resolved class. Concurrent
//! requests for the same key share one resolution through a pending entry.
//! Only classes defined by a system loader stay in the table; anything else
//! is resolved again on the next request. Entries initiated by a non-system
//! loader are chained under it and swept by a background reaper once that
//! loader is dropped.

mod key;
mod pending;
mod reaper;

use crossbeam::channel::{Sender, unbounded};
use dashmap::DashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

use crate::class::{ClassRef, LoaderId};
use crate::error::LoadError;
use crate::loader::ClassLoader;
use key::{CacheKey, Key, LoaderRef, LookupKey};
use pending::{PendingEntry, Slot};
use reaper::Notification;

/// Resolves a class name against an initiating loader.
pub type Resolver = dyn Fn(&str, &Arc<ClassLoader>) -> Result<ClassRef, LoadError> + Send + Sync;

pub struct ClassCache {
    tables: Arc<Tables>,
    reaper: Option<JoinHandle<()>>,
}

pub(crate) struct Tables {
    entries: DashMap<CacheKey, Slot>,
    loader_keys: DashMap<LoaderId, Vec<CacheKey>>,
    canonical: DashMap<LoaderId, Arc<LoaderRef>>,
    bootstrap: Arc<ClassLoader>,
    resolver: Box<Resolver>,
    notify: Sender<Notification>,
}

impl std::fmt::Debug for ClassCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassCache")
            .field("entries", &self.tables.entries.len())
            .field("loaders", &self.tables.canonical.len())
            .finish()
    }
}

impl ClassCache {
    /// A cache resolving through `ClassLoader::load_class`. `system` and its
    /// ancestors are the system loaders; the root of that chain stands in for
    /// an absent loader.
    pub fn new(system: &Arc<ClassLoader>) -> std::io::Result<Self> {
        Self::with_resolver(system, |name, loader| loader.load_class(name))
    }

    pub fn with_resolver(
        system: &Arc<ClassLoader>,
        resolver: impl Fn(&str, &Arc<ClassLoader>) -> Result<ClassRef, LoadError>
        + Send
        + Sync
        + 'static,
    ) -> std::io::Result<Self> {
        let canonical = DashMap::new();
        let mut bootstrap = Arc::clone(system);
        for loader in system.ancestors() {
            canonical.insert(loader.id(), Arc::new(LoaderRef::new(&loader, true)));
            bootstrap = loader;
        }

        let (notify, rx) = unbounded();
        let tables = Arc::new(Tables {
            entries: DashMap::new(),
            loader_keys: DashMap::new(),
            canonical,
            bootstrap,
            resolver: Box::new(resolver),
            notify,
        });
        let reaper = reaper::spawn(rx, Arc::downgrade(&tables))?;
        Ok(Self {
            tables,
            reaper: Some(reaper),
        })
    }

    /// Resolves `class_name` as seen from `loader`, or from the bootstrap
    /// loader when `None`. Failures are returned to every caller waiting on
    /// the same attempt but never kept.
    pub fn resolve(
        &self,
        class_name: &str,
        loader: Option<&Arc<ClassLoader>>,
    ) -> Result<ClassRef, LoadError> {
        let loader = loader.unwrap_or(&self.tables.bootstrap);
        let lookup = LookupKey::new(class_name, loader);

        let existing = self
            .tables
            .entries
            .get(&lookup as &dyn Key)
            .map(|slot| slot.value().clone());
        let pending = match existing.unwrap_or_else(|| self.tables.install(&lookup)) {
            Slot::Resolved(class) => return Ok(class),
            Slot::Pending(pending) => pending,
        };

        let (result, fresh) = pending.get(|| (self.tables.resolver)(class_name, loader));
        if fresh {
            self.tables.settle(&pending, result.as_ref());
        }
        result
    }

    /// Entries currently in the table, pending or resolved.
    pub fn len(&self) -> usize {
        self.tables.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.entries.is_empty()
    }

    pub fn is_canonical(&self, loader: LoaderId) -> bool {
        self.tables.canonical.contains_key(&loader)
    }

    pub fn is_system(&self, loader: LoaderId) -> bool {
        self.tables.is_system(loader)
    }

    /// Keys chained under a non-system initiating loader.
    pub fn chained_keys(&self, loader: LoaderId) -> usize {
        self.tables
            .loader_keys
            .get(&loader)
            .map_or(0, |keys| keys.len())
    }
}

impl Drop for ClassCache {
    fn drop(&mut self) {
        let watched: Vec<_> = self
            .tables
            .canonical
            .iter()
            .filter_map(|r| Some((r.upgrade()?, r.listener?)))
            .collect();
        for (loader, listener) in watched {
            loader.remove_unload_listener(listener);
        }
        let _ = self.tables.notify.send(Notification::Released);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
    }
}

impl Tables {
    /// Installs a pending entry for `lookup` unless another caller got there
    /// first, and returns whatever the table now holds.
    fn install(&self, lookup: &LookupKey<'_>) -> Slot {
        let key = lookup.cache_key(self.loader_ref(lookup.loader()));
        let pending = Arc::new(PendingEntry::new(key.clone()));
        self.entries
            .entry(key)
            .or_insert_with(|| Slot::Pending(pending))
            .value()
            .clone()
    }

    fn loader_ref(&self, loader: &Arc<ClassLoader>) -> Arc<LoaderRef> {
        if let Some(existing) = self.canonical.get(&loader.id()) {
            return Arc::clone(existing.value());
        }

        Arc::clone(
            self.canonical
                .entry(loader.id())
                .or_insert_with(|| {
                    let notify = self.notify.clone();
                    let listener = loader.on_unload(move |id| {
                        let _ = notify.send(Notification::Unloaded(id));
                    });
                    trace!(loader = %loader.id(), "registered loader");
                    Arc::new(LoaderRef::watched(loader, listener))
                })
                .value(),
        )
    }

    fn is_system(&self, loader: LoaderId) -> bool {
        self.canonical.get(&loader).is_some_and(|r| r.system)
    }

    fn settle(&self, pending: &Arc<PendingEntry>, result: Result<&ClassRef, &LoadError>) {
        match result {
            Ok(class) if self.is_system(class.loader_id()) => self.promote(pending, class),
            _ => self.evict(pending),
        }
    }

    /// Swaps the pending entry for the class, if it is still the one in the
    /// table.
    fn promote(&self, pending: &Arc<PendingEntry>, class: &ClassRef) {
        let key = pending.key();
        let Some(mut slot) = self.entries.get_mut(key) else {
            return;
        };
        if !matches!(&*slot, Slot::Pending(current) if Arc::ptr_eq(current, pending)) {
            return;
        }
        *slot = Slot::Resolved(Arc::clone(class));
        drop(slot);

        if !key.loader_ref().system {
            self.loader_keys
                .entry(key.loader_id())
                .or_default()
                .push(key.clone());
        }
    }

    fn evict(&self, pending: &Arc<PendingEntry>) {
        self.entries.remove_if(pending.key(), |_, slot| {
            matches!(slot, Slot::Pending(current) if Arc::ptr_eq(current, pending))
        });
    }

    /// Forgets a dropped loader and every key it initiated.
    fn remove_stale(&self, loader: LoaderId) -> usize {
        if let Some((_, loader_ref)) = self.canonical.remove(&loader) {
            debug_assert!(!loader_ref.is_alive());
        }
        let Some((_, keys)) = self.loader_keys.remove(&loader) else {
            return 0;
        };
        let removed = keys
            .iter()
            .filter(|key| self.entries.remove(*key).is_some())
            .count();
        debug!(loader = %loader, removed, "purged entries of unloaded loader");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{CLASS_MAGIC, Class, ClassOrigin, CodeSource};
    use crate::config::SharedClassSettings;
    use crate::loader::LoaderHierarchy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::time::Duration;

    fn hierarchy() -> LoaderHierarchy {
        LoaderHierarchy::builder().build(&SharedClassSettings::disabled())
    }

    fn fake_class(loader: &Arc<ClassLoader>, name: &str) -> ClassRef {
        let class = Class::define(
            name,
            &CLASS_MAGIC,
            loader,
            CodeSource::default(),
            None,
            ClassOrigin::ClassPath { index: 0 },
        )
        .unwrap();
        Arc::new(class)
    }

    #[test]
    fn registry_seeded_with_system_chain() {
        let h = hierarchy();
        let cache = ClassCache::new(h.system_loader()).unwrap();
        for loader in [&h.app, &h.platform, &h.boot] {
            assert!(cache.is_canonical(loader.id()));
            assert!(cache.is_system(loader.id()));
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn failure_is_shared_but_not_kept() {
        let h = hierarchy();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = ClassCache::with_resolver(h.system_loader(), move |name, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LoadError::ClassNotFound(name.to_string()))
        })
        .unwrap();

        assert!(cache.resolve("a.Missing", Some(&h.app)).is_err());
        assert!(cache.is_empty());
        assert!(cache.resolve("a.Missing", Some(&h.app)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn none_resolves_against_bootstrap() {
        let h = hierarchy();
        let seen = Arc::new(Mutex::new(None));
        let record = Arc::clone(&seen);
        let cache = ClassCache::with_resolver(h.system_loader(), move |name, loader| {
            *record.lock().unwrap() = Some(loader.id());
            Ok(fake_class(loader, name))
        })
        .unwrap();

        let class = cache.resolve("java.lang.Object", None).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(h.boot.id()));
        assert_eq!(class.loader_id(), h.boot.id());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn waiters_observe_the_same_resolution() {
        let h = hierarchy();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let cache = Arc::new(
            ClassCache::with_resolver(h.system_loader(), move |name, loader| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                Ok(fake_class(loader, name))
            })
            .unwrap(),
        );

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                let app = Arc::clone(&h.app);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.resolve("a.A", Some(&app)).unwrap()
                })
            })
            .collect();
        let classes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(classes.iter().all(|c| Arc::ptr_eq(c, &classes[0])));
    }

    #[test]
    fn dropping_cache_stops_reaper() {
        let h = hierarchy();
        let cache = ClassCache::new(h.system_loader()).unwrap();
        drop(cache);
        // Loaders outliving the cache still unload cleanly.
        let user = h.user_loader("late", Vec::new(), &SharedClassSettings::disabled());
        drop(user);
    }
}
