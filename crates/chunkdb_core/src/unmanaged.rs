//! Registry of self-tracking allocations.

use crate::pointer::ChunkPointer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A value that keeps track of its own address.
///
/// Relocation copies the value's chain, then calls
/// [`UnmanagedInstance::on_relocated`] before the referencing slot is
/// rewritten.
pub trait UnmanagedInstance: Send + Sync {
    /// Called after the value's bytes were copied from `old` to `new`.
    fn on_relocated(&self, old: ChunkPointer, new: ChunkPointer);
}

/// Maps chunk heads to their registered instance.
#[derive(Default)]
pub struct UnmanagedRegistry {
    instances: Mutex<HashMap<ChunkPointer, Arc<dyn UnmanagedInstance>>>,
}

impl UnmanagedRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` as the owner of the chain at `ptr`.
    pub fn register(&self, ptr: ChunkPointer, instance: Arc<dyn UnmanagedInstance>) {
        self.instances.lock().insert(ptr, instance);
    }

    /// Removes the instance registered at `ptr`.
    pub fn unregister(&self, ptr: ChunkPointer) -> Option<Arc<dyn UnmanagedInstance>> {
        self.instances.lock().remove(&ptr)
    }

    /// Instance registered at `ptr`.
    #[must_use]
    pub fn get(&self, ptr: ChunkPointer) -> Option<Arc<dyn UnmanagedInstance>> {
        self.instances.lock().get(&ptr).cloned()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-keys the instance at `old` to `new` and notifies it.
    ///
    /// Returns false if no instance was registered at `old`.
    pub fn relocate(&self, old: ChunkPointer, new: ChunkPointer) -> bool {
        let instance = {
            let mut instances = self.instances.lock();
            let Some(instance) = instances.remove(&old) else {
                return false;
            };
            instances.insert(new, Arc::clone(&instance));
            instance
        };
        instance.on_relocated(old, new);
        true
    }
}

impl std::fmt::Debug for UnmanagedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnmanagedRegistry")
            .field("instances", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Tracker {
        moves: Mutex<Vec<(ChunkPointer, ChunkPointer)>>,
    }

    impl UnmanagedInstance for Tracker {
        fn on_relocated(&self, old: ChunkPointer, new: ChunkPointer) {
            self.moves.lock().push((old, new));
        }
    }

    #[test]
    fn relocate_rekeys_and_notifies() {
        let registry = UnmanagedRegistry::new();
        let tracker = Arc::new(Tracker::default());
        let old = ChunkPointer::new(100).unwrap();
        let new = ChunkPointer::new(20).unwrap();
        registry.register(old, tracker.clone());

        assert!(registry.relocate(old, new));
        assert!(registry.get(old).is_none());
        assert!(registry.get(new).is_some());
        assert_eq!(*tracker.moves.lock(), vec![(old, new)]);
        assert!(!registry.relocate(old, new));
    }
}
