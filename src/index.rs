//! SQLite side index over record metadata.
//!
//! The index holds `(id, timestamp, method, url)` for each stored record so searches can skip
//! reading every record body. It is a cache: the backend stays authoritative, and
//! [`MetadataIndex::rebuild_from`] restores it from scratch.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::{Connection, OpenFlags, params};

use crate::{
    error::{Error, Result, join_error},
    record::Record,
    storage::{SearchQuery, StorageBackend, fold_case},
    timestamp::id_from_storage_key,
};

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone)]
pub struct MetadataIndex {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexEntry {
    id: String,
    timestamp: Option<String>,
    method: String,
    url: String,
}

impl IndexEntry {
    fn from_record(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            timestamp: record
                .timestamp
                .as_ref()
                .map(|timestamp| timestamp.as_str().to_owned()),
            method: record.method.clone(),
            url: record.url.clone(),
        }
    }
}

impl MetadataIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                Error::storage(format!("create index dir {}", parent.display()), err)
            })?;
        }
        let mut conn = open_connection(path)?;
        migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()
            .map_err(|err| Error::storage("open in-memory sqlite", err))?;
        migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn run<T, F>(&self, context: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut conn)
        })
        .await
        .map_err(|err| join_error(context, err))?
    }

    /// Inserts or refreshes the metadata row for `record`.
    pub async fn index(&self, record: &Record) -> Result<()> {
        let entry = IndexEntry::from_record(record);
        self.run("index record", move |conn| upsert_blocking(conn, &entry))
            .await
    }

    /// Ids of records matching `query`, oldest first. Empty queries match nothing.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<String>> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let query = query.clone();
        self.run("search index", move |conn| search_blocking(conn, &query))
            .await
    }

    /// Returns whether a row was removed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let id = id.to_owned();
        self.run("remove index entry", move |conn| {
            let removed = conn
                .execute("DELETE FROM request_metadata WHERE id = ?1", params![id])
                .map_err(|err| Error::storage("delete index entry", err))?;
            Ok(removed == 1)
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.run("clear index", |conn| {
            conn.execute("DELETE FROM request_metadata", [])
                .map_err(|err| Error::storage("clear index", err))?;
            Ok(())
        })
        .await
    }

    pub async fn len(&self) -> Result<usize> {
        self.run("count index entries", |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM request_metadata", [], |row| row.get(0))
                .map_err(|err| Error::storage("count index entries", err))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
        .await
    }

    /// Replaces the whole index with the records currently in `backend`. Returns how many
    /// records were indexed.
    pub async fn rebuild_from(&self, backend: &dyn StorageBackend) -> Result<usize> {
        let mut entries = Vec::new();
        for key in backend.sorted_identifiers().await? {
            let Some(id) = id_from_storage_key(&key) else {
                continue;
            };
            match backend.load(id).await {
                Ok(record) => entries.push(IndexEntry::from_record(&record)),
                // evicted or deleted while we were listing
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let count = entries.len();
        self.run("rebuild index", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|err| Error::storage("begin index rebuild", err))?;
            tx.execute("DELETE FROM request_metadata", [])
                .map_err(|err| Error::storage("clear index", err))?;
            for entry in &entries {
                upsert_blocking(&tx, entry)?;
            }
            tx.commit()
                .map_err(|err| Error::storage("commit index rebuild", err))
        })
        .await?;
        tracing::info!(records = count, "rebuilt metadata index");
        Ok(count)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .map_err(|err| Error::storage(format!("open sqlite {}", path.display()), err))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|err| Error::storage("set PRAGMA journal_mode=WAL", err))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|err| Error::storage("set PRAGMA synchronous=NORMAL", err))?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|err| Error::storage("set sqlite busy_timeout", err))?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .map_err(|err| Error::storage("read PRAGMA user_version", err))?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS request_metadata (
                  id TEXT PRIMARY KEY,
                  timestamp TEXT,
                  method TEXT NOT NULL,
                  url TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_request_metadata_timestamp
                  ON request_metadata(timestamp);
                "#,
            )
            .map_err(|err| Error::storage("create index schema v1", err))?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|err| Error::storage("set PRAGMA user_version=1", err))?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => Err(Error::validation(format!(
            "unsupported index schema version {user_version} (expected {SCHEMA_VERSION})"
        ))),
    }
}

fn upsert_blocking(conn: &Connection, entry: &IndexEntry) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO request_metadata (id, timestamp, method, url)
        VALUES (?1, ?2, ?3, ?4)
        "#,
        params![entry.id, entry.timestamp, entry.method, entry.url],
    )
    .map_err(|err| Error::storage(format!("index record `{}`", entry.id), err))?;
    Ok(())
}

fn search_blocking(conn: &Connection, query: &SearchQuery) -> Result<Vec<String>> {
    let method = query.method_filter().map(fold_case);
    let url = query.url_filter().map(fold_case);
    let start = query.range.start.as_ref().map(|ts| ts.as_str().to_owned());
    let end = query.range.end.as_ref().map(|ts| ts.as_str().to_owned());

    let mut stmt = conn
        .prepare(
            r#"
            SELECT id
            FROM request_metadata
            WHERE (?1 IS NULL OR instr(lower(method), ?1) > 0)
              AND (?2 IS NULL OR instr(lower(url), ?2) > 0)
              AND (?3 IS NULL OR timestamp >= ?3)
              AND (?4 IS NULL OR timestamp <= ?4)
            ORDER BY timestamp, id
            "#,
        )
        .map_err(|err| Error::storage("prepare index search", err))?;

    let mut rows = stmt
        .query(params![method, url, start, end])
        .map_err(|err| Error::storage("query index", err))?;

    let mut ids = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| Error::storage("iterate index rows", err))?
    {
        ids.push(
            row.get(0)
                .map_err(|err| Error::storage("read index row", err))?,
        );
    }
    Ok(ids)
}
