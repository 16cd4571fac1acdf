pub mod memory;
pub mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// String-keyed storage holding JSON-encoded values.
///
/// Single calls are atomic. Read-modify-write cycles must go through
/// [`KeyValueStore::atomically`] (or [`transaction`]) so that concurrent
/// writers, including other processes sharing the same database file,
/// cannot interleave with them.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Run `f` while holding the store's write lock.
    ///
    /// Transactions are not reentrant: `f` must not start another one on
    /// the same store. Plain `get`/`set` calls inside `f` are fine.
    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn KeyValueStore) -> StorageResult<()>,
    ) -> StorageResult<()>;
}

/// Typed wrapper around [`KeyValueStore::atomically`].
pub fn transaction<T, F>(store: &dyn KeyValueStore, f: F) -> StorageResult<T>
where
    F: FnOnce(&dyn KeyValueStore) -> StorageResult<T>,
{
    let mut body = Some(f);
    let mut output = None;
    store.atomically(&mut |tx: &dyn KeyValueStore| {
        if let Some(body) = body.take() {
            output = Some(body(tx)?);
        }
        Ok(())
    })?;
    output.ok_or_else(|| StorageError::Unavailable("transaction body did not run".into()))
}

/// Typed helpers on top of any [`KeyValueStore`].
pub trait JsonStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>>;
    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()>;
}

impl<S: KeyValueStore + ?Sized> JsonStore for S {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Serde {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let raw = serde_json::to_string(value).map_err(|source| StorageError::Serde {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw)
    }
}
