//! Assume cache: a store mirror with speculative overlays.
//!
//! Mirrors every object of one kind as last reported by the store, and lets
//! callers install an *assumed* version of an object ahead of the durable
//! write that will produce it. Readers see the assumed version until the
//! store catches up or the assumption is rolled back.
//!
//! # Lifecycle of an overlay
//!
//! ```text
//! assume(obj)          overlay installed, basis = obj.version
//! store event (newer)  overlay dropped, store has caught up
//! forget(key)          overlay dropped, rollback
//! ```
//!
//! All state sits behind one `RwLock`, so `get` never observes a half
//! applied `assume`/`forget`.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use claimgrid_state::{
    ChangeEvent, ChangeHandler, ObjectKey, ResourceVersion, StateStore, StoredObject,
};

use crate::error::{CoordinatorError, CoordinatorResult};

#[derive(Debug, Clone)]
struct Assumed<T> {
    object: T,
    /// Version of the stored object this overlay was derived from.
    basis: ResourceVersion,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    stored: T,
    assumed: Option<Assumed<T>>,
}

impl<T: StoredObject + PartialEq> Entry<T> {
    /// The store has caught up with the overlay.
    fn overlay_landed(&self) -> bool {
        self.assumed.as_ref().is_some_and(|a| {
            let version = self.stored.meta().version;
            version.is_newer_than(a.basis) || (version == a.basis && self.stored == a.object)
        })
    }
}

/// Store mirror with speculative overlays for objects of kind `T`.
pub struct AssumeCache<T> {
    entries: RwLock<BTreeMap<ObjectKey, Entry<T>>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: StoredObject + PartialEq> AssumeCache<T> {
    /// Build a cache mirroring `store` and keep it current via store
    /// notifications.
    pub fn new(store: &StateStore) -> CoordinatorResult<Arc<Self>> {
        let cache = Arc::new(Self::empty());
        // Subscribe before listing so no write falls between the two.
        store.subscribe(cache.clone());
        for object in store.list::<T>()? {
            cache.observe(object);
        }
        debug!(kind = %T::KIND, objects = cache.len(), "assume cache populated");
        Ok(cache)
    }

    /// A cache not attached to any store.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            _kind: PhantomData,
        }
    }

    /// The assumed object if present, else the last stored one.
    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        let entries = self.entries.read().expect("assume cache lock");
        entries
            .get(key)
            .map(|e| e.assumed.as_ref().map_or(&e.stored, |a| &a.object).clone())
    }

    /// The last stored object, ignoring any overlay.
    pub fn get_stored(&self, key: &ObjectKey) -> Option<T> {
        let entries = self.entries.read().expect("assume cache lock");
        entries.get(key).map(|e| e.stored.clone())
    }

    /// Every object, assumed version preferred, in key order.
    pub fn list(&self) -> Vec<T> {
        let entries = self.entries.read().expect("assume cache lock");
        entries
            .values()
            .map(|e| e.assumed.as_ref().map_or(&e.stored, |a| &a.object).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("assume cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_assumed(&self, key: &ObjectKey) -> bool {
        let entries = self.entries.read().expect("assume cache lock");
        entries.get(key).is_some_and(|e| e.assumed.is_some())
    }

    /// Install `object` as the assumed version of its key.
    ///
    /// `object.meta().version` names the stored version it was derived
    /// from; assuming on top of an outdated basis is rejected. Assuming an
    /// object identical to the stored one just clears any overlay.
    pub fn assume(&self, object: T) -> CoordinatorResult<()> {
        let key = object.key();
        let basis = object.meta().version;
        let mut entries = self.entries.write().expect("assume cache lock");
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| CoordinatorError::NotCached { key: key.clone() })?;

        let stored = entry.stored.meta().version;
        if stored.is_newer_than(basis) {
            return Err(CoordinatorError::AssumeOutdated {
                key,
                stored,
                assumed: basis,
            });
        }
        if stored == basis && entry.stored == object {
            entry.assumed = None;
            trace!(kind = %T::KIND, %key, "assumed object already stored");
            return Ok(());
        }
        entry.assumed = Some(Assumed { object, basis });
        debug!(kind = %T::KIND, %key, %basis, "object assumed");
        Ok(())
    }

    /// Drop the overlay for `key`, restoring the stored object.
    pub fn forget(&self, key: &ObjectKey) {
        let mut entries = self.entries.write().expect("assume cache lock");
        if let Some(entry) = entries.get_mut(key) {
            if entry.assumed.take().is_some() {
                debug!(kind = %T::KIND, %key, "assumed object forgotten");
            }
        }
    }

    /// Record a stored object reported by the store, dropping an overlay
    /// the store has caught up with.
    pub fn observe(&self, stored: T) {
        let key = stored.key();
        let mut entries = self.entries.write().expect("assume cache lock");
        match entries.get_mut(&key) {
            Some(entry) => {
                if entry.stored.meta().version.is_newer_than(stored.meta().version) {
                    trace!(kind = %T::KIND, %key, "ignoring stale object");
                    return;
                }
                entry.stored = stored;
                if entry.overlay_landed() {
                    entry.assumed = None;
                    debug!(kind = %T::KIND, %key, "assumed object confirmed");
                }
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        stored,
                        assumed: None,
                    },
                );
            }
        }
    }

    fn remove(&self, key: &ObjectKey) {
        let mut entries = self.entries.write().expect("assume cache lock");
        if entries.remove(key).is_some() {
            debug!(kind = %T::KIND, %key, "object removed from assume cache");
        }
    }
}

impl<T: StoredObject + PartialEq> ChangeHandler for AssumeCache<T> {
    fn on_change(&self, event: &ChangeEvent) {
        match (&event.old, &event.new) {
            (_, Some(new)) if !new.is_tombstone() => {
                if let Some(object) = T::from_watched(new) {
                    self.observe(object.clone());
                }
            }
            (Some(old), _) => {
                if let Some(object) = T::from_watched(old.unwrap_tombstone()) {
                    self.remove(&object.key());
                }
            }
            (None, Some(new)) => {
                if let Some(object) = T::from_watched(new.unwrap_tombstone()) {
                    self.remove(&object.key());
                }
            }
            (None, None) => {}
        }
    }
}
