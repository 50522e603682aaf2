//! Live process registry.
//!
//! Every OS process a spawner launches is recorded here until it is
//! reaped. The registry only hands out snapshots; ownership of the child
//! handles stays with the `Process` that launched them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pipewright_types::ProcessId;

use super::process::ChildProcess;

pub(crate) struct Registry {
    /// Counter for generating unique ids.
    next_id: AtomicU64,
    /// Children not yet reaped.
    live: Mutex<HashMap<ProcessId, Arc<ChildProcess>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> ProcessId {
        ProcessId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessId, Arc<ChildProcess>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, child: Arc<ChildProcess>) {
        self.live().insert(child.id(), child);
    }

    pub fn remove(&self, id: ProcessId) {
        self.live().remove(&id);
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<ChildProcess>> {
        self.live().get(&id).cloned()
    }

    /// Live children in launch order.
    pub fn snapshot(&self) -> Vec<Arc<ChildProcess>> {
        let mut children: Vec<_> = self.live().values().cloned().collect();
        children.sort_by_key(|c| c.id());
        children
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
