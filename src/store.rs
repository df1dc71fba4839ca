//! A backend wrapped with retention and an optional metadata index.

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::{
    config::{BackendKind, Config},
    error::Result,
    index::MetadataIndex,
    record::Record,
    retention::RetentionPolicy,
    storage::{
        FileStorage, MemoryStorage, ObjectStorage, SearchQuery, StorageBackend, object::S3Options,
    },
    timestamp::id_from_storage_key,
};

/// Composes a [`StorageBackend`] with a [`RetentionPolicy`] and, optionally, a
/// [`MetadataIndex`]. It is itself a backend, so loggers and replayers take it unchanged.
///
/// Every save is followed by an index update and a retention pass. The index is kept in step
/// with evictions and deletes made through this store; changes made to the backend directly
/// need [`RecordStore::rebuild_index`].
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StorageBackend>,
    retention: RetentionPolicy,
    index: Option<MetadataIndex>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("retention", &self.retention)
            .field("indexed", &self.index.is_some())
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            retention: RetentionPolicy::unbounded(),
            index: None,
        }
    }

    /// Builds the backend, retention policy and index named by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let storage = &config.storage;
        let backend: Arc<dyn StorageBackend> = match storage.backend {
            BackendKind::File => Arc::new(FileStorage::open(&storage.path).with_context(|| {
                format!("open file storage {}", storage.path.display())
            })?),
            BackendKind::ObjectStore => {
                let options = S3Options {
                    bucket: storage.bucket.clone().unwrap_or_default(),
                    region: storage.region.clone(),
                    endpoint: storage.endpoint.clone(),
                    allow_http: storage.allow_http,
                };
                Arc::new(
                    ObjectStorage::amazon_s3(&options, storage.prefix.as_deref())
                        .context("open object storage")?,
                )
            }
            BackendKind::Memory => Arc::new(MemoryStorage::new()),
        };

        let mut store = Self::new(backend).with_retention(RetentionPolicy {
            max_logs: storage.max_logs,
        });
        if let Some(index) = &config.index {
            let index = MetadataIndex::open(&index.path)
                .with_context(|| format!("open metadata index {}", index.path.display()))?;
            store = store.with_index(index);
        }
        Ok(store)
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_index(mut self, index: MetadataIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn index(&self) -> Option<&MetadataIndex> {
        self.index.as_ref()
    }

    /// Rebuilds the index from the backend. Returns `None` when no index is attached.
    pub async fn rebuild_index(&self) -> Result<Option<usize>> {
        match &self.index {
            Some(index) => Ok(Some(index.rebuild_from(self.backend.as_ref()).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StorageBackend for RecordStore {
    async fn save(&self, id: &str, record: Record) -> Result<Record> {
        let saved = self.backend.save(id, record).await?;
        if let Some(index) = &self.index {
            index.index(&saved).await?;
        }

        let evicted = self.retention.enforce(self.backend.as_ref()).await?;
        if let Some(index) = &self.index {
            for key in &evicted {
                if let Some(evicted_id) = id_from_storage_key(key) {
                    index.remove(evicted_id).await?;
                }
            }
        }
        if !evicted.is_empty() {
            tracing::info!(
                evicted = evicted.len(),
                max_logs = self.retention.max_logs,
                "evicted oldest request logs"
            );
        }
        Ok(saved)
    }

    async fn load(&self, id: &str) -> Result<Record> {
        self.backend.load(id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.backend.delete(id).await?;
        if let Some(index) = &self.index {
            index.remove(id).await?;
        }
        Ok(())
    }

    async fn delete_by_identifier(&self, identifier: &str) -> Result<()> {
        self.backend.delete_by_identifier(identifier).await?;
        if let (Some(index), Some(id)) = (&self.index, id_from_storage_key(identifier)) {
            index.remove(id).await?;
        }
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        self.backend.list_ids().await
    }

    async fn sorted_identifiers(&self) -> Result<Vec<String>> {
        self.backend.sorted_identifiers().await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>> {
        let Some(index) = &self.index else {
            return self.backend.search(query).await;
        };

        let mut records = Vec::new();
        for id in index.search(query).await? {
            match self.backend.load(&id).await {
                Ok(record) => records.push(record),
                Err(err) if err.is_not_found() => {
                    tracing::warn!(id = %id, "index entry has no stored record; skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }
}
