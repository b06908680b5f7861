//! In-memory blob store

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use common::error::StoreError;
use common::{ArtifactKind, ModelIdentifier};

use crate::store::ModelBlobStore;

/// Blob store kept in process memory
///
/// Useful for tests and for platforms without a writable cache directory.
/// Write and delete counts are tracked so callers can assert on cache traffic.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    /// Stored artifacts
    blobs: DashMap<(ModelIdentifier, ArtifactKind), Vec<u8>>,

    /// Number of successful writes
    writes: AtomicUsize,

    /// Number of deletes of existing artifacts
    deletes: AtomicUsize,
}

impl InMemoryBlobStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of writes performed so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Gets the number of artifacts deleted so far
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Replaces an artifact without counting it as a write
    pub fn seed(&self, id: &ModelIdentifier, kind: ArtifactKind, bytes: impl Into<Vec<u8>>) {
        self.blobs.insert((id.clone(), kind), bytes.into());
    }
}

#[async_trait]
impl ModelBlobStore for InMemoryBlobStore {
    async fn exists(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(&(id.clone(), kind)))
    }

    async fn read(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .get(&(id.clone(), kind))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("{} artifact for {}", kind, id)))
    }

    async fn write(&self, id: &ModelIdentifier, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.insert((id.clone(), kind), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<(), StoreError> {
        if self.blobs.remove(&(id.clone(), kind)).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_traffic() {
        let store = InMemoryBlobStore::new();
        let id = ModelIdentifier::new("flowers").unwrap();

        store.seed(&id, ArtifactKind::Source, b"seeded".to_vec());
        assert_eq!(store.write_count(), 0);
        assert!(store.exists(&id, ArtifactKind::Source).await.unwrap());

        store.write(&id, ArtifactKind::Compiled, b"compiled").await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.read(&id, ArtifactKind::Compiled).await.unwrap(), b"compiled");

        store.delete(&id, ArtifactKind::Compiled).await.unwrap();
        store.delete(&id, ArtifactKind::Compiled).await.unwrap();
        assert_eq!(store.delete_count(), 1);
        assert!(matches!(
            store.read(&id, ArtifactKind::Compiled).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
