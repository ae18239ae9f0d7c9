//! Keys of the deserialization class cache.
//!
//! `LookupKey` borrows the caller's loader for one lookup. `CacheKey` is what
//! the table stores; it reaches the loader only through a weak `LoaderRef`.
//! Both hash and compare through `dyn Key`, so a lookup never allocates.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::class::LoaderId;
use crate::loader::{ClassLoader, ListenerId};

/// Canonical, weak handle on a loader.
#[derive(Debug)]
pub(crate) struct LoaderRef {
    id: LoaderId,
    loader: Weak<ClassLoader>,
    pub(crate) system: bool,
    /// Unload listener the cache registered on a non-system loader.
    pub(crate) listener: Option<ListenerId>,
}

impl LoaderRef {
    pub(crate) fn new(loader: &Arc<ClassLoader>, system: bool) -> Self {
        Self {
            id: loader.id(),
            loader: Arc::downgrade(loader),
            system,
            listener: None,
        }
    }

    pub(crate) fn watched(loader: &Arc<ClassLoader>, listener: ListenerId) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new(loader, false)
        }
    }

    pub(crate) fn id(&self) -> LoaderId {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.loader.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<ClassLoader>> {
        self.loader.upgrade()
    }
}

pub(crate) trait Key {
    fn class_name(&self) -> &str;
    fn loader_id(&self) -> LoaderId;
}

impl Hash for dyn Key + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class_name().hash(state);
        self.loader_id().hash(state);
    }
}

impl PartialEq for dyn Key + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.loader_id() == other.loader_id() && self.class_name() == other.class_name()
    }
}

impl Eq for dyn Key + '_ {}

pub(crate) struct LookupKey<'a> {
    class_name: &'a str,
    loader: &'a Arc<ClassLoader>,
}

impl<'a> LookupKey<'a> {
    pub(crate) fn new(class_name: &'a str, loader: &'a Arc<ClassLoader>) -> Self {
        Self { class_name, loader }
    }

    pub(crate) fn loader(&self) -> &'a Arc<ClassLoader> {
        self.loader
    }

    pub(crate) fn cache_key(&self, loader_ref: Arc<LoaderRef>) -> CacheKey {
        debug_assert_eq!(loader_ref.id(), self.loader.id());
        CacheKey {
            class_name: Arc::from(self.class_name),
            loader_ref,
        }
    }
}

impl Key for LookupKey<'_> {
    fn class_name(&self) -> &str {
        self.class_name
    }

    fn loader_id(&self) -> LoaderId {
        self.loader.id()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheKey {
    class_name: Arc<str>,
    loader_ref: Arc<LoaderRef>,
}

impl CacheKey {
    pub(crate) fn loader_ref(&self) -> &LoaderRef {
        &self.loader_ref
    }
}

impl Key for CacheKey {
    fn class_name(&self) -> &str {
        &self.class_name
    }

    fn loader_id(&self) -> LoaderId {
        self.loader_ref.id()
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as &dyn Key).hash(state);
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        (self as &dyn Key) == (other as &dyn Key)
    }
}

impl Eq for CacheKey {}

impl<'a> Borrow<dyn Key + 'a> for CacheKey {
    fn borrow(&self) -> &(dyn Key + 'a) {
        self
    }
}
