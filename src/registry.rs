//! Handle registry: bidirectional maps between the local identifiers the
//! layer hands to overlays and the real handles held by the main
//! process.
//!
//! One [`HandleTable`] exists per opaque handle kind; the per-kind state
//! type carries whatever bookkeeping that kind needs (parent handle,
//! swapchain image bookkeeping, ...). The table mutex is held only for
//! lookup/insert/erase, never across an RPC.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::RawHandle;

/// Info record for one live handle.
#[derive(Debug, Clone)]
pub struct HandleInfo<T> {
    /// The real handle in the main process, or 0 for purely local
    /// facades.
    pub real: RawHandle,
    /// The owning handle (a session for swapchains and spaces, an action
    /// set for actions, 0 at the root).
    pub parent: RawHandle,
    pub state: T,
}

/// Map from local identifier to info for one handle kind, with a reverse
/// index from real handles.
pub struct HandleTable<T> {
    inner: Mutex<TableInner<T>>,
}

struct TableInner<T> {
    by_local: HashMap<RawHandle, HandleInfo<T>>,
    by_real: HashMap<RawHandle, RawHandle>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        HandleTable {
            inner: Mutex::new(TableInner {
                by_local: HashMap::new(),
                by_real: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, local: RawHandle, info: HandleInfo<T>) {
        let mut inner = self.inner.lock();
        if info.real != 0 {
            inner.by_real.insert(info.real, local);
        }
        inner.by_local.insert(local, info);
    }

    /// Remove a handle. Idempotent: removing an unknown local id returns
    /// `None` and changes nothing.
    pub fn remove(&self, local: RawHandle) -> Option<HandleInfo<T>> {
        let mut inner = self.inner.lock();
        let info = inner.by_local.remove(&local)?;
        if info.real != 0 {
            inner.by_real.remove(&info.real);
        }
        Some(info)
    }

    pub fn contains(&self, local: RawHandle) -> bool {
        self.inner.lock().by_local.contains_key(&local)
    }

    /// The real handle behind a local id.
    pub fn real_of(&self, local: RawHandle) -> Option<RawHandle> {
        self.inner.lock().by_local.get(&local).map(|i| i.real)
    }

    /// Reverse lookup: the local id that fronts a real handle.
    pub fn local_of(&self, real: RawHandle) -> Option<RawHandle> {
        self.inner.lock().by_real.get(&real).copied()
    }

    /// Run `f` on the info for `local` while holding the table lock.
    pub fn with<R>(&self, local: RawHandle, f: impl FnOnce(&mut HandleInfo<T>) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.by_local.get_mut(&local).map(f)
    }

    /// All live local ids (used for teardown sweeps).
    pub fn locals(&self) -> Vec<RawHandle> {
        self.inner.lock().by_local.keys().copied().collect()
    }

    /// All live local ids whose parent matches.
    pub fn children_of(&self, parent: RawHandle) -> Vec<RawHandle> {
        self.inner
            .lock()
            .by_local
            .iter()
            .filter(|(_, info)| info.parent == parent)
            .map(|(local, _)| *local)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> HandleTable<T> {
    pub fn get(&self, local: RawHandle) -> Option<HandleInfo<T>> {
        self.inner.lock().by_local.get(&local).cloned()
    }
}
