//! StateStore — redb-backed state persistence for Ridgeline.
//!
//! Provides typed CRUD operations over resource records, secret metadata,
//! scaling state and alarm state. All values are JSON-serialized into
//! redb's `&[u8]` value columns, except the raw secret digest key in the
//! settings table. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use ridge_core::DigestKey;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.open_table(SCALING_POLICIES).map_err(map_err!(Table))?;
        txn.open_table(ALARMS).map_err(map_err!(Table))?;
        txn.open_table(SETTINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Read-modify-write in one transaction. Returns `false` when the key
    /// is absent, in which case nothing is written.
    fn modify<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = match t.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            found = current.is_some();
            if let Some(mut record) = current {
                f(&mut record);
                let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(found)
    }

    fn delete(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Insert or update a resource record.
    pub fn put_resource(&self, record: &ResourceRecord) -> StateResult<()> {
        self.put(RESOURCES, &record.id, record)?;
        debug!(resource = %record.id, lifecycle = %record.lifecycle, "resource record stored");
        Ok(())
    }

    pub fn get_resource(&self, id: &str) -> StateResult<Option<ResourceRecord>> {
        self.get(RESOURCES, id)
    }

    /// List all resource records, ordered by id.
    pub fn list_resources(&self) -> StateResult<Vec<ResourceRecord>> {
        self.list(RESOURCES)
    }

    /// Delete a resource record. Returns true if it existed.
    pub fn delete_resource(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(RESOURCES, id)?;
        debug!(resource = %id, existed, "resource record deleted");
        Ok(existed)
    }

    // ── Secrets ────────────────────────────────────────────────────

    pub fn put_secret(&self, record: &SecretRecord) -> StateResult<()> {
        self.put(SECRETS, &record.name, record)?;
        debug!(secret = %record.name, version = record.version, "secret record stored");
        Ok(())
    }

    pub fn get_secret(&self, name: &str) -> StateResult<Option<SecretRecord>> {
        self.get(SECRETS, name)
    }

    /// Find the secret record owning `handle`.
    pub fn find_secret_by_handle(&self, handle: &str) -> StateResult<Option<SecretRecord>> {
        Ok(self
            .list_secrets()?
            .into_iter()
            .find(|s| s.handle == handle))
    }

    pub fn list_secrets(&self) -> StateResult<Vec<SecretRecord>> {
        self.list(SECRETS)
    }

    pub fn delete_secret(&self, name: &str) -> StateResult<bool> {
        self.delete(SECRETS, name)
    }

    // ── Scaling policies ───────────────────────────────────────────

    pub fn put_scaling_policy(&self, record: &ScalingPolicyRecord) -> StateResult<()> {
        self.put(SCALING_POLICIES, &record.target, record)
    }

    pub fn get_scaling_policy(&self, target: &str) -> StateResult<Option<ScalingPolicyRecord>> {
        self.get(SCALING_POLICIES, target)
    }

    pub fn list_scaling_policies(&self) -> StateResult<Vec<ScalingPolicyRecord>> {
        self.list(SCALING_POLICIES)
    }

    pub fn delete_scaling_policy(&self, target: &str) -> StateResult<bool> {
        self.delete(SCALING_POLICIES, target)
    }

    // ── Alarms ─────────────────────────────────────────────────────

    pub fn put_alarm(&self, record: &AlarmRecord) -> StateResult<()> {
        self.put(ALARMS, &record.spec.alarm_id, record)
    }

    pub fn get_alarm(&self, alarm_id: &str) -> StateResult<Option<AlarmRecord>> {
        self.get(ALARMS, alarm_id)
    }

    pub fn list_alarms(&self) -> StateResult<Vec<AlarmRecord>> {
        self.list(ALARMS)
    }

    pub fn delete_alarm(&self, alarm_id: &str) -> StateResult<bool> {
        self.delete(ALARMS, alarm_id)
    }

    /// Apply `f` to a stored alarm record atomically. Returns `false` if
    /// the alarm has no record.
    pub fn modify_alarm<F>(&self, alarm_id: &str, f: F) -> StateResult<bool>
    where
        F: FnOnce(&mut AlarmRecord),
    {
        self.modify(ALARMS, alarm_id, f)
    }

    // ── Settings ───────────────────────────────────────────────────

    /// The workspace's secret digest key, generated on first use.
    pub fn digest_key(&self) -> StateResult<DigestKey> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let key;
        {
            let mut t = txn.open_table(SETTINGS).map_err(map_err!(Table))?;
            let stored = t
                .get(DIGEST_KEY)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            key = match stored {
                Some(bytes) => DigestKey::from_slice(&bytes).map_err(map_err!(Deserialize))?,
                None => {
                    let fresh = DigestKey::generate().map_err(map_err!(Write))?;
                    t.insert(DIGEST_KEY, fresh.as_bytes().as_slice())
                        .map_err(map_err!(Write))?;
                    info!("secret digest key generated");
                    fresh
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(key)
    }
}
