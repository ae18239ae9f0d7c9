use dashmap::DashMap;

use super::ClassStore;
use crate::error::ProviderError;

/// In-process store; lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ProviderError> {
        self.entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn len(&self) -> Result<u64, ProviderError> {
        Ok(self.entries.len() as u64)
    }
}
