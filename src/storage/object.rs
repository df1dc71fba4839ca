//! Records kept in an object store (S3 and compatibles, or anything else `object_store` speaks).
//!
//! ## Layout
//!
//! ```text
//! <prefix>/<compact timestamp>_<id>.json
//! ```
//!
//! Listing goes through the store's paginated list API; object stores return keys in
//! lexicographic order, and the result is sorted again locally so custom stores need not.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt as _;
use object_store::{ObjectStore, PutPayload, aws::AmazonS3Builder, path::Path as ObjectPath};
use tokio::sync::Mutex as AsyncMutex;

use super::{SearchQuery, StorageBackend, with_timestamp};
use crate::{
    error::{Error, Result},
    record::Record,
    timestamp::{id_from_storage_key, key_matches_id, parse_storage_key, storage_key},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Options {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack, R2, ...).
    pub endpoint: Option<String>,
    pub allow_http: bool,
}

#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    prefix: Option<ObjectPath>,
    write_lock: Arc<AsyncMutex<()>>,
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Option<&str>) -> Result<Self> {
        let prefix = prefix
            .map(|prefix| prefix.trim_matches('/'))
            .filter(|prefix| !prefix.is_empty())
            .map(ObjectPath::parse)
            .transpose()
            .map_err(|err| Error::validation(format!("invalid object store prefix: {err}")))?;
        Ok(Self {
            store,
            prefix,
            write_lock: Arc::new(AsyncMutex::new(())),
        })
    }

    /// S3 backend. Credentials come from the usual `AWS_*` environment variables.
    pub fn amazon_s3(options: &S3Options, prefix: Option<&str>) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&options.bucket)
            .with_allow_http(options.allow_http);
        if let Some(region) = &options.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &options.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().map_err(|err| {
            Error::storage(format!("configure S3 bucket `{}`", options.bucket), err)
        })?;
        Self::new(Arc::new(store), prefix)
    }

    fn location(&self, key: &str) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => prefix.child(key),
            None => ObjectPath::from(key),
        }
    }

    /// Keys directly under the prefix. Deeper objects belong to other backends sharing the
    /// bucket and are never counted, listed or evicted here.
    async fn list_keys(&self) -> Result<Vec<String>> {
        let objects: Vec<_> = self
            .store
            .list(self.prefix.as_ref())
            .try_collect()
            .await
            .map_err(|err| Error::storage("list record objects", err))?;

        let mut keys: Vec<String> = objects
            .into_iter()
            .filter(|meta| self.is_direct_child(&meta.location))
            .map(|meta| meta.location.to_string())
            .filter(|location| parse_storage_key(location).is_some())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn is_direct_child(&self, location: &ObjectPath) -> bool {
        match &self.prefix {
            Some(prefix) => location
                .prefix_match(prefix)
                .is_some_and(|mut rest| rest.next().is_some() && rest.next().is_none()),
            None => location.parts().count() == 1,
        }
    }

    async fn find_key(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .list_keys()
            .await?
            .into_iter()
            .find(|key| key_matches_id(key, id)))
    }

    async fn get_record(&self, location: &str) -> Result<Record> {
        let path = ObjectPath::from(location);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::not_found(
                    id_from_storage_key(location).unwrap_or(location),
                ));
            }
            Err(err) => {
                return Err(Error::storage(format!("get record object {location}"), err));
            }
        };
        let bytes = result
            .bytes()
            .await
            .map_err(|err| Error::storage(format!("read record object {location}"), err))?;
        Record::from_json_slice(&bytes, location)
    }

    async fn delete_location(&self, location: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(location)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(Error::storage(
                format!("delete record object {location}"),
                err,
            )),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStorage {
    async fn save(&self, id: &str, record: Record) -> Result<Record> {
        let (record, timestamp) = with_timestamp(record, id)?;
        let path = self.location(&storage_key(&timestamp, id));
        let bytes = serde_json::to_vec(&record)
            .map_err(|err| Error::decode(format!("serialize record `{id}`"), err))?;

        let _guard = self.write_lock.lock().await;
        let previous = self.find_key(id).await?;
        self.store
            .put(&path, PutPayload::from(bytes))
            .await
            .map_err(|err| Error::storage(format!("put record object {path}"), err))?;
        let location = path.to_string();
        if let Some(previous) = previous.filter(|previous| *previous != location) {
            self.delete_location(&previous).await?;
        }
        tracing::debug!(id = %id, location = %path, "saved record object");
        Ok(record)
    }

    async fn load(&self, id: &str) -> Result<Record> {
        let key = self
            .find_key(id)
            .await?
            .ok_or_else(|| Error::not_found(id))?;
        self.get_record(&key).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match self.find_key(id).await? {
            Some(key) => self.delete_location(&key).await,
            None => Ok(()),
        }
    }

    async fn delete_by_identifier(&self, identifier: &str) -> Result<()> {
        if parse_storage_key(identifier).is_none() {
            return Err(Error::validation(format!(
                "`{identifier}` is not a record key"
            )));
        }
        let _guard = self.write_lock.lock().await;
        self.delete_location(identifier).await
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .list_keys()
            .await?
            .iter()
            .filter_map(|key| id_from_storage_key(key).map(str::to_owned))
            .collect())
    }

    async fn sorted_identifiers(&self) -> Result<Vec<String>> {
        self.list_keys().await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let mut matches = Vec::new();
        for key in self.list_keys().await? {
            let record = self.get_record(&key).await?;
            if query.matches_record(&record) {
                matches.push(record);
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::{ObjectStore, PutPayload, memory::InMemory, path::Path as ObjectPath};

    use super::ObjectStorage;
    use crate::{
        retention::RetentionPolicy,
        storage::{
            StorageBackend,
            tests::{exercise_backend_contract, record},
        },
        store::RecordStore,
    };

    #[tokio::test]
    async fn object_backend_honors_storage_contract() {
        let backend = ObjectStorage::new(Arc::new(InMemory::new()), Some("request-logs")).unwrap();
        exercise_backend_contract(&backend).await;
    }

    #[tokio::test]
    async fn object_backend_without_prefix_honors_storage_contract() {
        let backend = ObjectStorage::new(Arc::new(InMemory::new()), None).unwrap();
        exercise_backend_contract(&backend).await;
    }

    #[tokio::test]
    async fn keys_live_under_prefix_and_foreign_objects_are_skipped() {
        let store = Arc::new(InMemory::new());
        store
            .put(
                &ObjectPath::from("request-logs/README"),
                PutPayload::from_static(b"hi"),
            )
            .await
            .unwrap();
        let backend = ObjectStorage::new(store.clone(), Some("/request-logs/")).unwrap();

        backend
            .save(
                "abc",
                record("abc", "GET", "https://example.com/", "2024-02-03T04:05:06Z"),
            )
            .await
            .unwrap();

        assert_eq!(
            backend.sorted_identifiers().await.unwrap(),
            vec!["request-logs/20240203T040506.000000Z_abc.json".to_owned()]
        );
        let raw = store
            .get(&ObjectPath::from(
                "request-logs/20240203T040506.000000Z_abc.json",
            ))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["id"], "abc");
    }

    #[tokio::test]
    async fn nested_prefixes_do_not_share_records() {
        let store: Arc<InMemory> = Arc::new(InMemory::new());
        let archive = ObjectStorage::new(store.clone(), Some("logs/archive")).unwrap();
        let live = RecordStore::new(Arc::new(
            ObjectStorage::new(store.clone(), Some("logs")).unwrap(),
        ))
        .with_retention(RetentionPolicy::new(1));
        let root = ObjectStorage::new(store.clone(), None).unwrap();

        archive
            .save("arch", record("arch", "GET", "https://example.com/", "2020-01-01"))
            .await
            .unwrap();
        assert!(live.list_ids().await.unwrap().is_empty());

        live.save("new", record("new", "GET", "https://example.com/", "2024-01-01"))
            .await
            .unwrap();
        assert_eq!(live.list_ids().await.unwrap(), vec!["new".to_owned()]);
        assert_eq!(archive.list_ids().await.unwrap(), vec!["arch".to_owned()]);
        assert!(root.list_ids().await.unwrap().is_empty());
        assert!(live.load("arch").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn corrupt_object_is_a_decode_error() {
        let store = Arc::new(InMemory::new());
        store
            .put(
                &ObjectPath::from("20240101T000000.000000Z_bad.json"),
                PutPayload::from_static(b"[1, 2"),
            )
            .await
            .unwrap();
        let backend = ObjectStorage::new(store, None).unwrap();
        assert_eq!(backend.load("bad").await.unwrap_err().kind(), "decode");
    }
}
