//! StateStore: redb-backed versioned object store for ClaimGrid.
//!
//! Provides typed CRUD over every [`StoredObject`] kind. All values are
//! JSON-serialized into redb's `&[u8]` value columns. Writes assign a fresh
//! store-wide [`ResourceVersion`]; updates are compare-and-swap against the
//! version the caller read. Committed writes are fanned out to subscribed
//! [`ChangeHandler`]s.
//!
//! Objects carrying finalizers are not removed by `delete`; they are marked
//! `deletion_requested` and disappear once an update clears the last
//! finalizer.
//!
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::{Arc, RwLock};

use redb::{
    Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::version::ResourceVersion;
use crate::watch::{ChangeEvent, ChangeHandler};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type ObjectTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn table_for(kind: ObjectKind) -> ObjectTable {
    match kind {
        ObjectKind::ResourceClaim => CLAIMS,
        ObjectKind::DeviceClass => CLASSES,
        ObjectKind::ResourceSlice => SLICES,
        ObjectKind::ControlPlaneContext => CONTEXTS,
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Bump a counter inside an open write transaction and return the new value.
fn next_counter(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    handlers: Arc<RwLock<Vec<Arc<dyn ChangeHandler>>>>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing and simulation).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLAIMS).map_err(map_err!(Table))?;
        txn.open_table(CLASSES).map_err(map_err!(Table))?;
        txn.open_table(SLICES).map_err(map_err!(Table))?;
        txn.open_table(CONTEXTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Subscriptions ──────────────────────────────────────────────

    /// Register a handler for all subsequent committed writes.
    pub fn subscribe(&self, handler: Arc<dyn ChangeHandler>) {
        self.handlers
            .write()
            .expect("handlers lock")
            .push(handler);
    }

    fn notify(&self, event: ChangeEvent) {
        let handlers = self.handlers.read().expect("handlers lock").clone();
        for handler in handlers {
            handler.on_change(&event);
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get an object by key.
    pub fn get<T: StoredObject>(&self, key: &ObjectKey) -> StateResult<Option<T>> {
        let key = key.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(T::KIND))
            .map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all objects of one kind, in key order.
    pub fn list<T: StoredObject>(&self) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(table_for(T::KIND))
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create a new object. Assigns a uid (if empty) and the first version.
    pub fn create<T: StoredObject>(&self, obj: &T) -> StateResult<T> {
        let key = obj.key().table_key();
        if !obj.meta().version.is_unset() {
            return Err(StateError::Invalid {
                kind: T::KIND,
                key,
                reason: "version must not be set on create".to_string(),
            });
        }

        let mut created = obj.clone();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists { kind: T::KIND, key });
            }
        }
        if created.meta().uid.is_empty() {
            let uid = next_counter(&txn, UID_COUNTER)?;
            created.meta_mut().uid = format!("uid-{uid}");
        }
        let version = ResourceVersion::new(next_counter(&txn, RESOURCE_VERSION_COUNTER)?);
        created.meta_mut().version = version;
        let value = serde_json::to_vec(&created).map_err(map_err!(Serialize))?;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %T::KIND, %key, %version, "object created");

        self.notify(ChangeEvent::added(created.clone().into_watched()));
        Ok(created)
    }

    /// Compare-and-swap update.
    ///
    /// `obj.meta().version` must equal the stored version, otherwise the
    /// write is rejected with [`StateError::Conflict`]. The uid and the
    /// deletion marker cannot be changed through an update. Returns the
    /// object as stored.
    pub fn update<T: StoredObject>(&self, obj: &T) -> StateResult<T> {
        let key = obj.key().table_key();
        let expected = obj.meta().version;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let old: T = {
            let table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => {
                    return Err(StateError::NotFound {
                        kind: T::KIND,
                        key: key.clone(),
                    });
                }
            }
        };
        let actual = old.meta().version;
        if actual != expected {
            return Err(StateError::Conflict {
                kind: T::KIND,
                key,
                expected,
                actual,
            });
        }

        let mut updated = obj.clone();
        updated.meta_mut().uid = old.meta().uid.clone();
        updated.meta_mut().deletion_requested = old.meta().deletion_requested;
        let finalized = updated.meta().deletion_requested && updated.meta().finalizers.is_empty();

        if finalized {
            {
                let mut table = txn
                    .open_table(table_for(T::KIND))
                    .map_err(map_err!(Table))?;
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(kind = %T::KIND, %key, "last finalizer removed, object deleted");
            self.notify(ChangeEvent::deleted(old.into_watched()));
            return Ok(updated);
        }

        let version = ResourceVersion::new(next_counter(&txn, RESOURCE_VERSION_COUNTER)?);
        updated.meta_mut().version = version;
        let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %T::KIND, %key, %version, "object updated");

        self.notify(ChangeEvent::updated(
            old.into_watched(),
            updated.clone().into_watched(),
        ));
        Ok(updated)
    }

    /// Delete an object, optionally only if it is still at `precondition`.
    ///
    /// Objects with finalizers are marked for deletion instead of removed.
    /// Returns true if the object existed.
    pub fn delete<T: StoredObject>(
        &self,
        key: &ObjectKey,
        precondition: Option<ResourceVersion>,
    ) -> StateResult<bool> {
        let key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let old: T = {
            let table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Ok(false),
            }
        };
        if let Some(expected) = precondition {
            let actual = old.meta().version;
            if actual != expected {
                return Err(StateError::Conflict {
                    kind: T::KIND,
                    key,
                    expected,
                    actual,
                });
            }
        }

        if !old.meta().finalizers.is_empty() {
            if old.meta().deletion_requested {
                return Ok(true);
            }
            let mut marked = old.clone();
            marked.meta_mut().deletion_requested = true;
            let version = ResourceVersion::new(next_counter(&txn, RESOURCE_VERSION_COUNTER)?);
            marked.meta_mut().version = version;
            let value = serde_json::to_vec(&marked).map_err(map_err!(Serialize))?;
            {
                let mut table = txn
                    .open_table(table_for(T::KIND))
                    .map_err(map_err!(Table))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(
                kind = %T::KIND,
                %key,
                finalizers = ?marked.meta().finalizers,
                "deletion requested"
            );
            self.notify(ChangeEvent::updated(old.into_watched(), marked.into_watched()));
            return Ok(true);
        }

        {
            let mut table = txn
                .open_table(table_for(T::KIND))
                .map_err(map_err!(Table))?;
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %T::KIND, %key, "object deleted");
        self.notify(ChangeEvent::deleted(old.into_watched()));
        Ok(true)
    }
}
