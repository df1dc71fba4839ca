use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{SearchQuery, StorageBackend, with_timestamp};
use crate::{
    error::{Error, Result},
    record::Record,
    timestamp::{id_from_storage_key, key_matches_id, storage_key},
};

/// Process-local backend for tests and throwaway sessions. Nothing survives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    records: Arc<Mutex<BTreeMap<String, Record>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Record>> {
        // a panic while holding the lock cannot leave the map half-written
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key_for_id(records: &BTreeMap<String, Record>, id: &str) -> Option<String> {
    records.keys().find(|key| key_matches_id(key, id)).cloned()
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save(&self, id: &str, record: Record) -> Result<Record> {
        let (record, timestamp) = with_timestamp(record, id)?;
        let key = storage_key(&timestamp, id);

        let mut records = self.lock();
        if let Some(previous) = key_for_id(&records, id).filter(|previous| *previous != key) {
            records.remove(&previous);
        }
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn load(&self, id: &str) -> Result<Record> {
        let records = self.lock();
        key_for_id(&records, id)
            .and_then(|key| records.get(&key).cloned())
            .ok_or_else(|| Error::not_found(id))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.lock();
        if let Some(key) = key_for_id(&records, id) {
            records.remove(&key);
        }
        Ok(())
    }

    async fn delete_by_identifier(&self, identifier: &str) -> Result<()> {
        self.lock().remove(identifier);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .keys()
            .filter_map(|key| id_from_storage_key(key).map(str::to_owned))
            .collect())
    }

    async fn sorted_identifiers(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>> {
        Ok(self
            .lock()
            .values()
            .filter(|record| query.matches_record(record))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStorage;
    use crate::storage::tests::exercise_backend_contract;

    #[tokio::test]
    async fn memory_backend_honors_storage_contract() {
        let backend = MemoryStorage::new();
        exercise_backend_contract(&backend).await;
        assert_eq!(backend.len(), 1);
    }
}
