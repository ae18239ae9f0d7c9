//! Shared-class provider contract and the classpath-scoped provider handle.
//!
//! A `ProviderFactory` is injected through `SharedClassSettings`; it hands
//! every loader its own `SharedClassProvider` handle, or nothing, in which
//! case the loader runs without sharing.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::class::{LoaderId, class_name_to_class_path};
use crate::error::ProviderError;
use crate::resource::file_url_to_path;

pub mod lmdb;
pub mod memory;

pub use lmdb::LmdbStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy)]
pub struct ProviderOwner<'a> {
    pub id: LoaderId,
    pub name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedClass {
    pub bytes: Vec<u8>,
    /// Classpath index the bytes were stored under.
    pub index: usize,
}

pub trait SharedClassProvider: Send + Sync {
    fn find_by_classpath(&self, class_name: &str) -> Result<Option<CachedClass>, ProviderError>;

    fn store_by_classpath(
        &self,
        class_name: &str,
        bytes: &[u8],
        index: usize,
    ) -> Result<bool, ProviderError>;

    fn find_by_url(&self, location: &str, class_name: &str)
    -> Result<Option<Vec<u8>>, ProviderError>;

    fn store_by_url(
        &self,
        location: &str,
        class_name: &str,
        bytes: &[u8],
    ) -> Result<bool, ProviderError>;

    /// Called when the owner appends an entry to its search path.
    fn search_path_appended(&self, _location: &str) {}
}

pub trait ProviderFactory: Send + Sync {
    fn initialize(
        &self,
        owner: ProviderOwner<'_>,
        search_path: &[String],
        boot: bool,
        cache_dir: bool,
    ) -> Option<Arc<dyn SharedClassProvider>>;
}

/// Byte-blob storage behind `ClasspathProvider`.
pub trait ClassStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProviderError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ProviderError>;
    fn len(&self) -> Result<u64, ProviderError>;
}

pub fn location_fingerprint(location: &str) -> String {
    let digest = Sha256::digest(location.as_bytes());
    hex::encode(&digest[..12])
}

pub fn entry_key(class_name: &str, location: &str) -> String {
    format!("{class_name}::{}", location_fingerprint(location))
}

/// Length and modification time of the file a stored class was read from:
/// the class file under a directory location, the archive otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    len: u64,
    modified: u64,
}

impl Stamp {
    const ENCODED_LEN: usize = 17;

    /// `None` when the location is not a readable `file:` URL.
    pub fn of(location: &str, class_name: &str) -> Option<Self> {
        let root = file_url_to_path(location)?;
        let file = if location.ends_with('/') {
            root.join(class_name_to_class_path(class_name))
        } else {
            root
        };
        let meta = std::fs::metadata(file).ok()?;
        let modified = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some(Self {
            len: meta.len(),
            modified: u64::try_from(modified.as_nanos()).unwrap_or(u64::MAX),
        })
    }
}

/// Prefixes `bytes` with the stamp header stored in front of every blob.
fn seal(stamp: Option<Stamp>, bytes: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(Stamp::ENCODED_LEN + bytes.len());
    let (tag, stamp) = match stamp {
        Some(stamp) => (1u8, stamp),
        None => (0u8, Stamp { len: 0, modified: 0 }),
    };
    blob.push(tag);
    blob.extend_from_slice(&stamp.len.to_le_bytes());
    blob.extend_from_slice(&stamp.modified.to_le_bytes());
    blob.extend_from_slice(bytes);
    blob
}

fn unseal(blob: &[u8]) -> Option<(Option<Stamp>, &[u8])> {
    if blob.len() < Stamp::ENCODED_LEN {
        return None;
    }
    let (header, bytes) = blob.split_at(Stamp::ENCODED_LEN);
    let len = u64::from_le_bytes(header[1..9].try_into().ok()?);
    let modified = u64::from_le_bytes(header[9..17].try_into().ok()?);
    match header[0] {
        0 => Some((None, bytes)),
        1 => Some((Some(Stamp { len, modified }), bytes)),
        _ => None,
    }
}

/// Provider handle scoped to one loader's search path.
///
/// Blobs carry the `Stamp` of their source at store time; an entry whose
/// source has since changed is reported as absent.
pub struct ClasspathProvider {
    store: Arc<dyn ClassStore>,
    owner: String,
    search_path: RwLock<Vec<String>>,
}

impl ClasspathProvider {
    pub fn new(store: Arc<dyn ClassStore>, owner: &str, search_path: &[String]) -> Self {
        Self {
            store,
            owner: owner.to_string(),
            search_path: RwLock::new(search_path.to_vec()),
        }
    }

    pub fn search_path(&self) -> Vec<String> {
        self.search_path.read().clone()
    }

    fn fresh_blob(
        &self,
        location: &str,
        class_name: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        let Some(blob) = self.store.get(&entry_key(class_name, location))? else {
            return Ok(None);
        };
        match unseal(&blob) {
            Some((stamp, bytes)) if stamp == Stamp::of(location, class_name) => {
                Ok(Some(bytes.to_vec()))
            }
            Some(_) => {
                debug!(owner = %self.owner, class_name, location, "stored class is stale");
                Ok(None)
            }
            None => {
                debug!(owner = %self.owner, class_name, location, "unreadable stored class");
                Ok(None)
            }
        }
    }

    fn put_stamped(
        &self,
        location: &str,
        class_name: &str,
        bytes: &[u8],
    ) -> Result<(), ProviderError> {
        let blob = seal(Stamp::of(location, class_name), bytes);
        self.store.put(&entry_key(class_name, location), &blob)
    }
}

impl SharedClassProvider for ClasspathProvider {
    fn find_by_classpath(&self, class_name: &str) -> Result<Option<CachedClass>, ProviderError> {
        let search_path = self.search_path.read().clone();
        for (index, location) in search_path.iter().enumerate() {
            if let Some(bytes) = self.fresh_blob(location, class_name)? {
                return Ok(Some(CachedClass { bytes, index }));
            }
        }
        Ok(None)
    }

    fn store_by_classpath(
        &self,
        class_name: &str,
        bytes: &[u8],
        index: usize,
    ) -> Result<bool, ProviderError> {
        let Some(location) = self.search_path.read().get(index).cloned() else {
            debug!(owner = %self.owner, class_name, index, "index outside search path");
            return Ok(false);
        };
        self.put_stamped(&location, class_name, bytes)?;
        Ok(true)
    }

    fn find_by_url(
        &self,
        location: &str,
        class_name: &str,
    ) -> Result<Option<Vec<u8>>, ProviderError> {
        self.fresh_blob(location, class_name)
    }

    fn store_by_url(
        &self,
        location: &str,
        class_name: &str,
        bytes: &[u8],
    ) -> Result<bool, ProviderError> {
        self.put_stamped(location, class_name, bytes)?;
        Ok(true)
    }

    fn search_path_appended(&self, location: &str) {
        self.search_path.write().push(location.to_string());
    }
}

/// Hands every loader a `ClasspathProvider` over one shared store.
#[derive(Clone)]
pub struct StoreProviderFactory {
    store: Arc<dyn ClassStore>,
}

impl StoreProviderFactory {
    pub fn new(store: Arc<dyn ClassStore>) -> Self {
        Self { store }
    }
}

impl ProviderFactory for StoreProviderFactory {
    fn initialize(
        &self,
        owner: ProviderOwner<'_>,
        search_path: &[String],
        boot: bool,
        cache_dir: bool,
    ) -> Option<Arc<dyn SharedClassProvider>> {
        debug!(
            loader = %owner.id,
            name = owner.name,
            entries = search_path.len(),
            boot,
            cache_dir,
            "attaching shared class provider"
        );
        Some(Arc::new(ClasspathProvider::new(
            Arc::clone(&self.store),
            owner.name,
            search_path,
        )))
    }
}
