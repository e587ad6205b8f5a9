//! Typed per-connection side table
//!
//! Modules attach capabilities to a connection under a tag. Each
//! [`ExtensionKey`] pairs the tag with the stored type, so lookups are typed
//! at the call site and absent by default.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Capability tags that may be attached to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionTag {
    Session,
    /// Tags defined by modules outside this crate
    Custom(&'static str),
}

/// A tag bound to the type stored under it
pub struct ExtensionKey<T> {
    tag: ExtensionTag,
    _type: PhantomData<fn() -> T>,
}

impl<T> ExtensionKey<T> {
    pub const fn new(tag: ExtensionTag) -> Self {
        Self {
            tag,
            _type: PhantomData,
        }
    }

    pub fn tag(&self) -> ExtensionTag {
        self.tag
    }
}

/// Extensions of one connection
#[derive(Default)]
pub struct Extensions {
    entries: RwLock<HashMap<ExtensionTag, Arc<dyn Any + Send + Sync>>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `value`, returning whatever was stored under the tag before
    pub fn insert<T: Send + Sync + 'static>(
        &self,
        key: &ExtensionKey<T>,
        value: Arc<T>,
    ) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .insert(key.tag, value)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn get<T: Send + Sync + 'static>(&self, key: &ExtensionKey<T>) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key.tag)
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove<T: Send + Sync + 'static>(&self, key: &ExtensionKey<T>) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .remove(&key.tag)
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains(&self, tag: ExtensionTag) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(&tag)
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        f.debug_set().entries(entries.keys()).finish()
    }
}
