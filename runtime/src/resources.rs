//! Typed resources shared with every invocation.
//!
//! Blocks reach clients, caches and similar handles through
//! [`Invocation::resource`](crate::Invocation::resource) instead of globals.
//! Lookup is by type, never by string key.

use ahash::AHashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct Resources {
    entries: AHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource, replacing any previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, resource: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(resource));
    }

    pub fn with<T: Send + Sync + 'static>(mut self, resource: T) -> Self {
        self.insert(resource);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: 'static>(&mut self) -> bool {
        self.entries.remove(&TypeId::of::<T>()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("resource_count", &self.entries.len())
            .finish()
    }
}
