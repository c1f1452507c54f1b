//! Promise-creation tracking.
//!
//! Every [`super::VirtualLoop::make_promise`] call registers the call site
//! under a fresh id; completing the promise removes the entry. If the loop
//! is dropped while entries remain, that's a leaked promise — a programmer
//! error. Registration is cheap enough to keep in all builds; only the
//! leak-on-drop panic itself is compiled out of release (see `LoopInner`'s
//! `Drop` impl).

use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub(super) struct PromiseRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, &'static Location<'static>>>,
}

impl PromiseRegistry {
    pub(super) fn register(&self, location: &'static Location<'static>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().insert(id, location);
        id
    }

    pub(super) fn complete(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    pub(super) fn outstanding(&self) -> Vec<&'static Location<'static>> {
        self.entries.lock().unwrap().values().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_removes_the_entry() {
        let registry = PromiseRegistry::default();
        let id = registry.register(Location::caller());
        assert_eq!(registry.outstanding().len(), 1);
        registry.complete(id);
        assert!(registry.outstanding().is_empty());
    }
}
