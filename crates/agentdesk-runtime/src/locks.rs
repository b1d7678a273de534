//! Per-project mutual exclusion.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Registry of one mutex per project id.
///
/// Entries are never removed: a holder of a removed entry would no longer
/// exclude a caller that created a fresh one.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `project_id`.
    pub fn with_lock<T>(&self, project_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = self
            .locks
            .lock()
            .entry(project_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock();
        f()
    }
}
