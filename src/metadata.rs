//! Index-addressed store of code source + manifest per classpath entry.
//!
//! One record per classpath index, created on the first fresh definition
//! from that index and never replaced afterwards. Cached definitions read
//! it to avoid re-resolving the resource.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::class::CodeSource;
use crate::manifest::Manifest;

pub const BLOCK_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub code_source: CodeSource,
    pub manifest: Option<Arc<Manifest>>,
}

#[derive(Debug)]
pub struct MetadataStore {
    store: Mutex<Vec<Option<Arc<MetadataRecord>>>>,
}

impl MetadataStore {
    pub fn new(initial_size: usize) -> Self {
        Self {
            store: Mutex::new(vec![None; initial_size]),
        }
    }

    /// None when nothing was stored at `index` or it is out of range.
    pub fn get(&self, index: usize) -> Option<Arc<MetadataRecord>> {
        self.store.lock().get(index).cloned().flatten()
    }

    /// Stores `make()` at `index` unless a record is already there, growing
    /// the store as needed. Returns whichever record ends up stored.
    pub fn get_or_insert_with(
        &self,
        index: usize,
        make: impl FnOnce() -> MetadataRecord,
    ) -> Arc<MetadataRecord> {
        let mut store = self.store.lock();
        ensure_size(&mut store, index);
        Arc::clone(store[index].get_or_insert_with(|| Arc::new(make())))
    }

    pub fn capacity(&self) -> usize {
        self.store.lock().len()
    }

    pub fn len(&self) -> usize {
        self.store.lock().iter().filter(|r| r.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn ensure_size(store: &mut Vec<Option<Arc<MetadataRecord>>>, index: usize) {
    if store.len() < index + 1 {
        store.resize(index + BLOCK_SIZE, None);
    }
}
