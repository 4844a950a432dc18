//! Blob storage backends.
//!
//! A backend only maps digests to bytes. Digest computation, tagging and
//! reference counting live in [`LayerStore`](super::LayerStore).

use dashmap::DashMap;
use dockyard_core::error::{EngineError, Result};
use dockyard_core::Digest;
use std::path::{Path, PathBuf};

/// Raw content-addressed byte storage.
pub trait BlobBackend: Send + Sync {
    /// Store bytes under `digest`. Writing the same digest twice is harmless.
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()>;

    fn read(&self, digest: &Digest) -> Result<Option<Vec<u8>>>;

    fn exists(&self, digest: &Digest) -> bool;

    fn len(&self, digest: &Digest) -> Option<u64>;

    /// Delete a blob. Returns whether it existed.
    fn delete(&self, digest: &Digest) -> Result<bool>;

    /// All stored digests, in no particular order.
    fn list(&self) -> Result<Vec<Digest>>;
}

/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    blobs: DashMap<Digest, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobBackend for MemoryBackend {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        self.blobs.insert(digest.clone(), data.to_vec());
        Ok(())
    }

    fn read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(digest).map(|b| b.value().clone()))
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(digest)
    }

    fn len(&self, digest: &Digest) -> Option<u64> {
        self.blobs.get(digest).map(|b| b.len() as u64)
    }

    fn delete(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.remove(digest).is_some())
    }

    fn list(&self) -> Result<Vec<Digest>> {
        Ok(self.blobs.iter().map(|e| e.key().clone()).collect())
    }
}

/// Disk backend laid out as `<root>/sha256/<hex>`.
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Open (creating if needed) a blob directory.
    pub fn new(root: &Path) -> Result<Self> {
        let blobs = root.join("sha256");
        std::fs::create_dir_all(&blobs).map_err(|e| {
            EngineError::Other(format!(
                "failed to create blob directory {}: {}",
                blobs.display(),
                e
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("sha256").join(digest.hex())
    }
}

impl BlobBackend for DiskBackend {
    fn write(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }

        // Unique tmp name so concurrent writers of the same digest don't collide
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp_path, data).map_err(|e| {
            EngineError::Other(format!(
                "failed to write blob {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            EngineError::Other(format!(
                "failed to rename {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.blob_path(digest)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    fn len(&self, digest: &Digest) -> Option<u64> {
        std::fs::metadata(self.blob_path(digest)).ok().map(|m| m.len())
    }

    fn delete(&self, digest: &Digest) -> Result<bool> {
        match std::fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<Digest>> {
        let mut digests = Vec::new();
        for entry in std::fs::read_dir(self.root.join("sha256"))? {
            let entry = entry?;
            let name = entry.file_name();
            // Skip leftover tmp files and anything else that isn't a digest
            if let Ok(digest) = format!("sha256:{}", name.to_string_lossy()).parse::<Digest>() {
                digests.push(digest);
            }
        }
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &dyn BlobBackend) {
        let digest = Digest::of(b"hello");
        assert!(!backend.exists(&digest));
        assert!(backend.read(&digest).unwrap().is_none());

        backend.write(&digest, b"hello").unwrap();
        backend.write(&digest, b"hello").unwrap();
        assert!(backend.exists(&digest));
        assert_eq!(backend.len(&digest), Some(5));
        assert_eq!(backend.read(&digest).unwrap().unwrap(), b"hello");
        assert_eq!(backend.list().unwrap(), vec![digest.clone()]);

        assert!(backend.delete(&digest).unwrap());
        assert!(!backend.delete(&digest).unwrap());
        assert!(backend.list().unwrap().is_empty());
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn test_disk_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        exercise(&backend);
    }

    #[test]
    fn test_disk_backend_layout() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let digest = Digest::of(b"layer");
        backend.write(&digest, b"layer").unwrap();
        assert!(dir.path().join("sha256").join(digest.hex()).is_file());
    }

    #[test]
    fn test_disk_backend_ignores_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("sha256").join("junk.tmp-1"), b"x").unwrap();
        assert!(backend.list().unwrap().is_empty());
    }
}
