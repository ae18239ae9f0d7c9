use parking_lot::Mutex;
use std::sync::Arc;

use super::key::CacheKey;
use crate::class::ClassRef;
use crate::error::LoadError;

/// A table value: either a resolution in progress or a promoted class.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Pending(Arc<PendingEntry>),
    Resolved(ClassRef),
}

#[derive(Debug)]
enum PendingState {
    Unresolved,
    Resolved(ClassRef),
    Failed(LoadError),
}

/// Placeholder installed by the first caller for a key. Resolution runs
/// under the entry's own lock, so only threads asking for the same key wait.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    key: CacheKey,
    state: Mutex<PendingState>,
}

impl PendingEntry {
    pub(crate) fn new(key: CacheKey) -> Self {
        Self {
            key,
            state: Mutex::new(PendingState::Unresolved),
        }
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Runs `resolve` unless an earlier caller already did. The flag tells
    /// whether this call did the work.
    pub(crate) fn get(
        &self,
        resolve: impl FnOnce() -> Result<ClassRef, LoadError>,
    ) -> (Result<ClassRef, LoadError>, bool) {
        let mut state = self.state.lock();
        match &*state {
            PendingState::Resolved(class) => return (Ok(Arc::clone(class)), false),
            PendingState::Failed(err) => return (Err(err.clone()), false),
            PendingState::Unresolved => {}
        }
        let result = resolve();
        *state = match &result {
            Ok(class) => PendingState::Resolved(Arc::clone(class)),
            Err(err) => PendingState::Failed(err.clone()),
        };
        (result, true)
    }
}
