//! Capture outbound HTTP requests into a durable, queryable log and replay them later.
//!
//! ```text
//! RequestLogger::capture ─► codec::serialize ─► RecordStore::save
//!                                               ├─ StorageBackend::save
//!                                               ├─ MetadataIndex::index
//!                                               └─ RetentionPolicy::enforce
//! Replayer::replay ─► StorageBackend::load ─► codec::reconstruct ─► HttpClient::send
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod logger;
pub mod logging;
pub mod record;
pub mod replay;
pub mod request;
pub mod retention;
pub mod storage;
pub mod store;
pub mod timestamp;

pub use client::{HttpClient, HttpResponse, HyperClient, LoggedClient};
pub use error::{Error, Result};
pub use index::MetadataIndex;
pub use logger::RequestLogger;
pub use record::{Headers, Record};
pub use replay::{Modifications, ReplayError, Replayer};
pub use request::{FileField, Payload, RequestSpec};
pub use retention::RetentionPolicy;
pub use storage::{FileStorage, MemoryStorage, ObjectStorage, SearchQuery, StorageBackend};
pub use store::RecordStore;
pub use timestamp::{TimeRange, Timestamp};
