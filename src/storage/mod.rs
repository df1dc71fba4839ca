//! Durable homes for captured records.
//!
//! Every backend stores a record under `<compact timestamp>_<id>.json`, so listing keys in
//! lexicographic order lists records oldest first. Retention and range queries rely on that.

pub mod file;
pub mod memory;
pub mod object;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use object::ObjectStorage;

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    record::Record,
    timestamp::{TimeRange, Timestamp},
};

/// Capability shared by all record backends.
///
/// Mutating calls on one instance are serialized by that instance; callers may share a backend
/// across tasks freely.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Upserts `record` under `id`, assigning a timestamp when it has none. A previous record
    /// with the same id is replaced even if it was stored under a different timestamp.
    async fn save(&self, id: &str, record: Record) -> Result<Record>;

    /// Fails with [`Error::NotFound`](crate::Error::NotFound) when no record has this id.
    async fn load(&self, id: &str) -> Result<Record>;

    /// No-op when the id is unknown.
    async fn delete(&self, id: &str) -> Result<()>;

    /// No-op when the key is unknown.
    async fn delete_by_identifier(&self, identifier: &str) -> Result<()>;

    /// Record ids, oldest first.
    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Storage keys in ascending lexicographic (and therefore chronological) order.
    async fn sorted_identifiers(&self) -> Result<Vec<String>>;

    /// Full records matching every supplied predicate, oldest first. Empty queries match
    /// nothing.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Case-insensitive substring of the method.
    pub method: Option<String>,
    /// Case-insensitive substring of the prepared URL.
    pub url: Option<String>,
    pub range: TimeRange,
}

impl SearchQuery {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn range(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    /// Method filter, trimmed, `None` when blank.
    pub fn method_filter(&self) -> Option<&str> {
        non_blank(self.method.as_deref())
    }

    pub fn url_filter(&self) -> Option<&str> {
        non_blank(self.url.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.method_filter().is_none() && self.url_filter().is_none() && self.range.is_unbounded()
    }

    /// Evaluates the query against one record's indexed fields.
    pub fn matches(&self, method: &str, url: &str, timestamp: Option<&Timestamp>) -> bool {
        if self.is_empty() {
            return false;
        }
        let method_ok = self
            .method_filter()
            .is_none_or(|needle| contains_ignore_case(method, needle));
        let url_ok = self
            .url_filter()
            .is_none_or(|needle| contains_ignore_case(url, needle));
        let time_ok = self.range.is_unbounded()
            || timestamp.is_some_and(|timestamp| self.range.contains(timestamp));
        method_ok && url_ok && time_ok
    }

    pub fn matches_record(&self, record: &Record) -> bool {
        self.matches(&record.method, &record.url, record.timestamp.as_ref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Case folding shared by backend scans and the SQLite index. SQLite's `lower()` only folds
/// ASCII, so both paths fold ASCII only and agree on non-ASCII text.
pub(crate) fn fold_case(value: &str) -> String {
    value.to_ascii_lowercase()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    fold_case(haystack).contains(fold_case(needle).as_str())
}

/// Ids become part of a storage key, so they must be a single non-empty path segment.
pub(crate) fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::validation("request id cannot be empty"));
    }
    if id.contains(['/', '\\']) {
        return Err(Error::validation(format!(
            "request id `{id}` cannot contain path separators"
        )));
    }
    Ok(())
}

/// Returns the record with a timestamp, stamping it now if it has none.
pub(crate) fn with_timestamp(mut record: Record, id: &str) -> Result<(Record, Timestamp)> {
    validate_id(id)?;
    record.id = id.to_owned();
    let timestamp = record.timestamp.clone().unwrap_or_else(Timestamp::now);
    record.timestamp = Some(timestamp.clone());
    Ok((record, timestamp))
}
