//! Blob store contract

use async_trait::async_trait;

use common::error::StoreError;
use common::{ArtifactKind, ModelIdentifier};

/// Durable storage for model artifacts, keyed by identifier and kind
///
/// Implementations make no promise about the content they return: a previous
/// run may have crashed mid-write, so callers validate compiled artifacts
/// before trusting them.
#[async_trait]
pub trait ModelBlobStore: Send + Sync {
    /// Returns true if an artifact of `kind` is stored for `id`
    async fn exists(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<bool, StoreError>;

    /// Reads the artifact of `kind` stored for `id`
    async fn read(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<Vec<u8>, StoreError>;

    /// Stores `bytes` as the artifact of `kind` for `id`, replacing any previous one
    async fn write(&self, id: &ModelIdentifier, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError>;

    /// Deletes the artifact of `kind` for `id`; deleting a missing artifact succeeds
    async fn delete(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<(), StoreError>;
}
