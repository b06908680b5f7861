//! Filesystem blob store
//!
//! Layout: `<root>/<model id>/source.artifact` and `<root>/<model id>/compiled.artifact`.
//! Writes land in a `.partial` sibling first and are renamed into place, so a
//! crash leaves either the previous artifact or a stray partial file, never a
//! half-written artifact under the final name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytesize::ByteSize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use common::error::StoreError;
use common::{ArtifactKind, ModelIdentifier};

use crate::store::ModelBlobStore;

/// Blob store backed by a directory tree
#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    /// Root of the cache
    root: PathBuf,
}

impl FilesystemBlobStore {
    /// Creates a store rooted at `root`, creating the directory if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        info!("Model artifact cache at {:?}", root);

        Ok(Self { root })
    }

    /// Gets the cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the path an artifact is stored at
    pub fn artifact_path(&self, id: &ModelIdentifier, kind: ArtifactKind) -> PathBuf {
        self.root.join(id.as_str()).join(kind.file_name())
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".partial");
        path.with_file_name(name)
    }
}

#[async_trait]
impl ModelBlobStore for FilesystemBlobStore {
    async fn exists(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<bool, StoreError> {
        match tokio::fs::metadata(self.artifact_path(id, kind)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<Vec<u8>, StoreError> {
        let path = self.artifact_path(id, kind);

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!("Read {} artifact for {} ({})", kind, id, ByteSize::b(bytes.len() as u64));
                Ok(bytes)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("{} artifact for {}", kind, id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, id: &ModelIdentifier, kind: ArtifactKind, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.artifact_path(id, kind);
        let partial = Self::partial_path(&path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&partial).await?;
        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }

        tokio::fs::rename(&partial, &path).await?;

        debug!("Wrote {} artifact for {} ({})", kind, id, ByteSize::b(bytes.len() as u64));

        Ok(())
    }

    async fn delete(&self, id: &ModelIdentifier, kind: ArtifactKind) -> Result<(), StoreError> {
        let path = self.artifact_path(id, kind);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted {} artifact for {}", kind, id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to delete {:?}: {}", path, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ModelIdentifier {
        ModelIdentifier::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path().join("cache")).await.unwrap();
        let flowers = id("flowers");

        assert!(!store.exists(&flowers, ArtifactKind::Source).await.unwrap());

        store.write(&flowers, ArtifactKind::Source, b"source bytes").await.unwrap();
        assert!(store.exists(&flowers, ArtifactKind::Source).await.unwrap());
        assert!(!store.exists(&flowers, ArtifactKind::Compiled).await.unwrap());
        assert_eq!(store.read(&flowers, ArtifactKind::Source).await.unwrap(), b"source bytes");

        // Overwrite replaces the previous artifact
        store.write(&flowers, ArtifactKind::Source, b"v2").await.unwrap();
        assert_eq!(store.read(&flowers, ArtifactKind::Source).await.unwrap(), b"v2");

        store.delete(&flowers, ArtifactKind::Source).await.unwrap();
        assert!(!store.exists(&flowers, ArtifactKind::Source).await.unwrap());

        // Deleting again is not an error
        store.delete(&flowers, ArtifactKind::Source).await.unwrap();
    }

    #[tokio::test]
    async fn test_layout_is_per_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        store.write(&id("a"), ArtifactKind::Compiled, b"aaa").await.unwrap();
        store.write(&id("b"), ArtifactKind::Compiled, b"bbb").await.unwrap();

        let path = store.artifact_path(&id("a"), ArtifactKind::Compiled);
        assert_eq!(path, dir.path().join("a").join("compiled.artifact"));
        assert_eq!(std::fs::read(path).unwrap(), b"aaa");
        assert!(!FilesystemBlobStore::partial_path(&store.artifact_path(&id("a"), ArtifactKind::Compiled)).exists());
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path()).await.unwrap();

        let err = store.read(&id("missing"), ArtifactKind::Source).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
