use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{SearchQuery, StorageBackend, with_timestamp};
use crate::{
    error::{Error, Result, join_error},
    record::Record,
    timestamp::{RECORD_KEY_SUFFIX, id_from_storage_key, key_matches_id, storage_key},
};

const TEMP_SUFFIX: &str = ".tmp";

/// One pretty-printed JSON file per record inside a single directory.
///
/// Lookups by id and searches scan the directory; pair this backend with a
/// [`MetadataIndex`](crate::index::MetadataIndex) when the log grows large.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl FileStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            Error::storage(format!("create storage dir {}", dir.display()), err)
        })?;
        Ok(Self {
            dir,
            lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs `op` on the blocking pool, holding the instance lock for its whole duration.
    async fn run<T, F>(&self, context: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&dir)
        })
        .await
        .map_err(|err| join_error(context, err))?
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn save(&self, id: &str, record: Record) -> Result<Record> {
        let (record, timestamp) = with_timestamp(record, id)?;
        let key = storage_key(&timestamp, id);
        let bytes = record.to_json_pretty()?;
        let id = id.to_owned();

        self.run("save record", move |dir| {
            let previous = find_key_blocking(dir, &id)?;
            write_record_blocking(dir, &key, &bytes)?;
            if let Some(previous) = previous.filter(|previous| *previous != key) {
                remove_file_blocking(&dir.join(previous))?;
            }
            tracing::debug!(id = %id, key = %key, "saved record file");
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn load(&self, id: &str) -> Result<Record> {
        let id = id.to_owned();
        self.run("load record", move |dir| {
            let key = find_key_blocking(dir, &id)?.ok_or_else(|| Error::not_found(&id))?;
            read_record_blocking(&dir.join(&key), &key)
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_owned();
        self.run("delete record", move |dir| match find_key_blocking(dir, &id)? {
            Some(key) => remove_file_blocking(&dir.join(key)),
            None => Ok(()),
        })
        .await
    }

    async fn delete_by_identifier(&self, identifier: &str) -> Result<()> {
        let identifier = identifier.to_owned();
        self.run("delete record by key", move |dir| {
            if !is_record_key(&identifier) {
                return Err(Error::validation(format!(
                    "`{identifier}` is not a record key"
                )));
            }
            remove_file_blocking(&dir.join(&identifier))
        })
        .await
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let keys = self.sorted_identifiers().await?;
        Ok(keys
            .iter()
            .filter_map(|key| id_from_storage_key(key).map(str::to_owned))
            .collect())
    }

    async fn sorted_identifiers(&self) -> Result<Vec<String>> {
        self.run("list record files", list_keys_blocking).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let query = query.clone();
        self.run("search record files", move |dir| {
            let mut matches = Vec::new();
            for key in list_keys_blocking(dir)? {
                let record = read_record_blocking(&dir.join(&key), &key)?;
                if query.matches_record(&record) {
                    matches.push(record);
                }
            }
            Ok(matches)
        })
        .await
    }
}

fn is_record_key(name: &str) -> bool {
    !name.contains(['/', '\\']) && id_from_storage_key(name).is_some()
}

fn list_keys_blocking(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| Error::storage(format!("read storage dir {}", dir.display()), err))?;

    let mut keys = Vec::new();
    for entry_result in entries {
        let entry = entry_result.map_err(|err| {
            Error::storage(format!("iterate storage dir {}", dir.display()), err)
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(RECORD_KEY_SUFFIX) && is_record_key(&name) {
            keys.push(name);
        }
    }
    keys.sort();
    Ok(keys)
}

fn find_key_blocking(dir: &Path, id: &str) -> Result<Option<String>> {
    Ok(list_keys_blocking(dir)?
        .into_iter()
        .find(|key| key_matches_id(key, id)))
}

fn read_record_blocking(path: &Path, key: &str) -> Result<Record> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let id = id_from_storage_key(key).unwrap_or(key);
            return Err(Error::not_found(id));
        }
        Err(err) => {
            return Err(Error::storage(
                format!("read record file {}", path.display()),
                err,
            ));
        }
    };
    Record::from_json_slice(&bytes, key)
}

fn write_record_blocking(dir: &Path, key: &str, bytes: &[u8]) -> Result<()> {
    let final_path = dir.join(key);
    let temp_path = dir.join(format!("{key}{TEMP_SUFFIX}"));
    fs::write(&temp_path, bytes).map_err(|err| {
        Error::storage(format!("write record file {}", temp_path.display()), err)
    })?;
    fs::rename(&temp_path, &final_path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        Error::storage(
            format!("move record file into place {}", final_path.display()),
            err,
        )
    })
}

fn remove_file_blocking(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::storage(
            format!("delete record file {}", path.display()),
            err,
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::FileStorage;
    use crate::{
        retention::RetentionPolicy,
        storage::{
            SearchQuery, StorageBackend,
            tests::{exercise_backend_contract, record},
        },
    };

    #[tokio::test]
    async fn file_backend_honors_storage_contract() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileStorage::open(temp_dir.path().join("request_logs")).unwrap();
        exercise_backend_contract(&backend).await;
    }

    #[tokio::test]
    async fn records_are_pretty_json_files_named_by_timestamp_and_id() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileStorage::open(temp_dir.path()).unwrap();
        backend
            .save(
                "5f0c",
                record("5f0c", "GET", "https://example.com/", "2024-05-06T07:08:09.5Z"),
            )
            .await
            .unwrap();

        let path = temp_dir.path().join("20240506T070809.500000Z_5f0c.json");
        let contents = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value["id"], "5f0c");
        assert_eq!(value["timestamp"], "2024-05-06T07:08:09.500000Z");
        assert_eq!(value["method"], "GET");
        assert!(contents.contains("\n  \"url\""), "expected indented JSON");
    }

    #[tokio::test]
    async fn foreign_files_are_ignored_and_corrupt_records_surface() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileStorage::open(temp_dir.path()).unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(temp_dir.path().join("readme.json"), "{}").unwrap();
        fs::write(
            temp_dir.path().join("20240101T000000.000000Z_broken.json"),
            "{not json",
        )
        .unwrap();

        assert_eq!(backend.list_ids().await.unwrap(), vec!["broken".to_owned()]);
        let err = backend.load("broken").await.unwrap_err();
        assert_eq!(err.kind(), "decode");

        let err = backend
            .search(&SearchQuery::default().method("GET"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[tokio::test]
    async fn retention_leaves_underscored_json_files_alone() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileStorage::open(temp_dir.path()).unwrap();
        let stray = temp_dir.path().join("package_lock.json");
        fs::write(&stray, "{}").unwrap();
        backend
            .save("kept", record("kept", "GET", "https://example.com/", "2024-01-01"))
            .await
            .unwrap();

        assert_eq!(backend.list_ids().await.unwrap(), vec!["kept".to_owned()]);
        let evicted = RetentionPolicy::new(1).enforce(&backend).await.unwrap();
        assert!(evicted.is_empty(), "{evicted:?}");
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn delete_by_identifier_rejects_paths() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileStorage::open(temp_dir.path()).unwrap();
        let err = backend
            .delete_by_identifier("../20240101T000000.000000Z_x.json")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn concurrent_saves_all_land() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = FileStorage::open(temp_dir.path()).unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let backend = backend.clone();
            tasks.spawn(async move {
                let id = format!("id-{i:02}");
                let mut rec = record(&id, "GET", "https://example.com/", "2024-01-01");
                rec.timestamp = None;
                backend.save(&id, rec).await.unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert_eq!(backend.list_ids().await.unwrap().len(), 16);
    }
}
