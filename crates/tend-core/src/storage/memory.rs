use std::collections::BTreeMap;
use std::sync::Mutex;

use super::KeyValueStore;
use crate::error::StorageResult;

/// In-process store. Nothing survives a restart.
///
/// Transactions are serialized but not rolled back on error.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    writer: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .lock()?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock()?.remove(key);
        Ok(())
    }

    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn KeyValueStore) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let _writer = self.writer.lock()?;
        f(self)
    }
}
