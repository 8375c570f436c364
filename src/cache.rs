use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Queue names that have passed an existence check on the broker.
///
/// Cloning shares the underlying map. The lock is only ever held for a single
/// lookup or insert, never across a broker call.
#[derive(Debug, Clone, Default)]
pub struct DestinationCache {
    validated: Arc<Mutex<HashMap<String, bool>>>,
}

impl DestinationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_validated(&self, destination: &str) -> bool {
        self.lock().get(destination).copied().unwrap_or(false)
    }

    pub fn mark_validated(&self, destination: &str) {
        self.lock().insert(destination.to_string(), true);
    }

    /// Forget every validated destination.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Entries stay valid even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, bool>> {
        self.validated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
