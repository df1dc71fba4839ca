use std::sync::Arc;

use uuid::Uuid;

use crate::{
    client::{HttpClient, LoggedClient},
    codec,
    error::Result,
    request::RequestSpec,
    storage::StorageBackend,
};

/// Public capture API: turns a call into a stored record and hands the call back untouched.
#[derive(Clone)]
pub struct RequestLogger {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLogger").finish_non_exhaustive()
    }
}

impl RequestLogger {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Records `spec` under a fresh UUIDv4 id without sending it.
    ///
    /// The returned spec still owns the caller's file streams, positioned where they were, so
    /// it can go straight to a transport.
    pub async fn capture(&self, mut spec: RequestSpec) -> Result<(String, RequestSpec)> {
        let id = Uuid::new_v4().to_string();
        let record = codec::serialize(id.clone(), &mut spec)?;
        let record = self.storage.save(&id, record).await?;
        tracing::info!(
            id = %id,
            method = %record.method,
            url = %record.url,
            files = record.files.len(),
            "captured request"
        );
        Ok((id, spec))
    }

    pub fn logged_client<C: HttpClient>(&self, inner: C) -> LoggedClient<C> {
        LoggedClient::new(self.clone(), inner)
    }
}
