use crate::{error::Result, storage::StorageBackend};

/// Caps how many records a backend keeps. `None` keeps everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_logs: Option<usize>,
}

impl RetentionPolicy {
    pub fn new(max_logs: usize) -> Self {
        Self {
            max_logs: Some(max_logs),
        }
    }

    pub fn unbounded() -> Self {
        Self { max_logs: None }
    }

    /// Deletes the oldest records until at most `max_logs` remain and returns the evicted keys.
    ///
    /// Keys are ordered by the backend's `sorted_identifiers`, which is chronological, so the
    /// oldest records always go first.
    pub async fn enforce(&self, backend: &dyn StorageBackend) -> Result<Vec<String>> {
        let Some(max_logs) = self.max_logs else {
            return Ok(Vec::new());
        };

        let keys = backend.sorted_identifiers().await?;
        if keys.len() <= max_logs {
            return Ok(Vec::new());
        }

        let excess = keys.len() - max_logs;
        let evicted: Vec<String> = keys.into_iter().take(excess).collect();
        for key in &evicted {
            backend.delete_by_identifier(key).await?;
        }
        tracing::debug!(evicted = evicted.len(), max_logs, "enforced retention");
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::RetentionPolicy;
    use crate::storage::{MemoryStorage, StorageBackend, tests::record};

    async fn fill(backend: &MemoryStorage, count: usize) {
        for i in 0..count {
            let id = format!("id-{i}");
            let timestamp = format!("2024-01-{:02}T00:00:00Z", i + 1);
            backend
                .save(&id, record(&id, "GET", "https://example.com/", &timestamp))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn evicts_oldest_records_beyond_cap() {
        let backend = MemoryStorage::new();
        fill(&backend, 7).await;

        let evicted = RetentionPolicy::new(3).enforce(&backend).await.unwrap();

        assert_eq!(evicted.len(), 4);
        assert!(evicted[0].ends_with("_id-0.json"), "{evicted:?}");
        assert_eq!(
            backend.list_ids().await.unwrap(),
            vec!["id-4".to_owned(), "id-5".to_owned(), "id-6".to_owned()]
        );
    }

    #[tokio::test]
    async fn under_cap_keeps_everything() {
        let backend = MemoryStorage::new();
        fill(&backend, 5).await;

        let evicted = RetentionPolicy::new(10).enforce(&backend).await.unwrap();

        assert!(evicted.is_empty());
        assert_eq!(backend.len(), 5);
    }

    #[tokio::test]
    async fn unbounded_and_zero_caps() {
        let backend = MemoryStorage::new();
        fill(&backend, 4).await;

        assert!(
            RetentionPolicy::unbounded()
                .enforce(&backend)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(backend.len(), 4);

        RetentionPolicy::new(0).enforce(&backend).await.unwrap();
        assert!(backend.is_empty());
    }
}
