//! Durable storage for checkpoint manifests and other run artifacts.

use crate::checkpoint::{CheckpointManifest, StorageRef};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::ArtifactLayout;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Mutex;

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write-once blob storage. A reference is durable once `write` returns.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn write(&self, bytes: &[u8]) -> TrainingResult<StorageRef>;

    async fn read(&self, storage_ref: &StorageRef) -> TrainingResult<Vec<u8>>;

    /// Every reference currently held, in no particular order.
    async fn list(&self) -> TrainingResult<Vec<StorageRef>>;
}

/// Reads and decodes a checkpoint manifest, `None` when the blob is something else.
pub async fn read_manifest(
    storage: &dyn ArtifactStorage,
    storage_ref: &StorageRef,
) -> TrainingResult<Option<CheckpointManifest>> {
    let bytes = storage.read(storage_ref).await?;
    Ok(serde_json::from_slice::<CheckpointManifest>(&bytes).ok().filter(CheckpointManifest::is_checkpoint))
}

fn validate_digest(storage_ref: &StorageRef) -> TrainingResult<&str> {
    let digest = storage_ref.as_str();
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(digest)
    } else {
        Err(TrainingError::Artifact(format!("malformed storage reference: {storage_ref}")))
    }
}

/// Content-addressed store under `<root>/objects/<sha256>.json`.
#[derive(Debug, Clone)]
pub struct FsArtifactStorage {
    layout: ArtifactLayout,
}

impl FsArtifactStorage {
    pub fn new(layout: ArtifactLayout) -> TrainingResult<Self> {
        std::fs::create_dir_all(layout.objects_dir())?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }
}

#[async_trait]
impl ArtifactStorage for FsArtifactStorage {
    async fn write(&self, bytes: &[u8]) -> TrainingResult<StorageRef> {
        let digest = sha256_bytes(bytes);
        let path = self.layout.object_path(&digest);
        if tokio::fs::try_exists(&path).await? {
            return Ok(StorageRef::new(digest));
        }

        // Write then rename so a crash never leaves a partial object behind.
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(StorageRef::new(digest))
    }

    async fn read(&self, storage_ref: &StorageRef) -> TrainingResult<Vec<u8>> {
        let digest = validate_digest(storage_ref)?;
        let bytes = tokio::fs::read(self.layout.object_path(digest)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrainingError::NotFound(format!("artifact {storage_ref}"))
            } else {
                TrainingError::Io(e)
            }
        })?;
        if sha256_bytes(&bytes) != digest {
            return Err(TrainingError::Artifact(format!("artifact {storage_ref} failed integrity check")));
        }
        Ok(bytes)
    }

    async fn list(&self) -> TrainingResult<Vec<StorageRef>> {
        let mut refs = Vec::new();
        let mut entries = tokio::fs::read_dir(self.layout.objects_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(digest) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let storage_ref = StorageRef::new(digest);
            if validate_digest(&storage_ref).is_ok() {
                refs.push(storage_ref);
            }
        }
        Ok(refs)
    }
}

/// In-memory content-addressed store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStorage for MemoryArtifactStorage {
    async fn write(&self, bytes: &[u8]) -> TrainingResult<StorageRef> {
        let digest = sha256_bytes(bytes);
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(digest.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(StorageRef::new(digest))
    }

    async fn read(&self, storage_ref: &StorageRef) -> TrainingResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(storage_ref.as_str())
            .cloned()
            .ok_or_else(|| TrainingError::NotFound(format!("artifact {storage_ref}")))
    }

    async fn list(&self) -> TrainingResult<Vec<StorageRef>> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .map(|digest| StorageRef::new(digest.as_str()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_storage_is_content_addressed() {
        let temp = TempDir::new().unwrap();
        let storage = FsArtifactStorage::new(ArtifactLayout::new(temp.path().to_path_buf())).unwrap();

        let first = storage.write(b"{\"a\":1}").await.unwrap();
        let second = storage.write(b"{\"a\":1}").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.list().await.unwrap(), vec![first.clone()]);
        assert_eq!(storage.read(&first).await.unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_fs_storage_rejects_traversal_and_missing() {
        let temp = TempDir::new().unwrap();
        let storage = FsArtifactStorage::new(ArtifactLayout::new(temp.path().to_path_buf())).unwrap();

        let bad = storage.read(&StorageRef::new("../../etc/passwd")).await;
        assert!(matches!(bad, Err(TrainingError::Artifact(_))));

        let missing = storage.read(&StorageRef::new("a".repeat(64))).await;
        assert!(matches!(missing, Err(TrainingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_read_manifest_skips_foreign_blobs() {
        let storage = MemoryArtifactStorage::new();
        let manifest = CheckpointManifest::new(RunId::from("r"), 4, None, Default::default(), false);
        let manifest_ref = storage.write(&serde_json::to_vec(&manifest).unwrap()).await.unwrap();
        let other_ref = storage.write(b"not json").await.unwrap();

        assert_eq!(read_manifest(&storage, &manifest_ref).await.unwrap(), Some(manifest));
        assert_eq!(read_manifest(&storage, &other_ref).await.unwrap(), None);
        assert_eq!(storage.len(), 2);
    }
}
