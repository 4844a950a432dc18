//! Image bundles: the hand-off shape for registry transfer.
//!
//! A bundle is a serialized manifest plus its layer blobs in manifest
//! order. Pushing and pulling are left to an external collaborator; the
//! engine only produces and verifies bundles. Bundles can be saved as a
//! tar archive holding `manifest.json` and `blobs/sha256/<hex>`.

use std::io::{Read, Write};

use dockyard_core::error::{EngineError, Result};
use dockyard_core::{Digest, ImageManifest};

use crate::store::LayerStore;

const MANIFEST_ENTRY: &str = "manifest.json";
const BLOBS_PREFIX: &str = "blobs/sha256/";

/// A manifest and the layers it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBundle {
    /// Canonical manifest bytes
    pub manifest: Vec<u8>,
    /// Layer blobs in manifest order
    pub layers: Vec<(Digest, Vec<u8>)>,
}

impl ImageBundle {
    /// Digest of the manifest bytes, i.e. the image id.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.manifest)
    }

    /// Collect an image and its layers from `store`.
    pub fn export(store: &LayerStore, digest: &Digest) -> Result<Self> {
        let manifest = store.get(digest)?;
        let parsed = ImageManifest::from_bytes(&manifest)?;
        let layers = parsed
            .layers
            .iter()
            .map(|d| Ok((d.clone(), store.get(d)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { manifest, layers })
    }

    /// Verify every blob and store them. Returns the manifest digest.
    ///
    /// Nothing is written unless the whole bundle verifies.
    pub fn import(&self, store: &LayerStore) -> Result<Digest> {
        let manifest = ImageManifest::from_bytes(&self.manifest)?;

        for (declared, data) in &self.layers {
            let actual = Digest::of(data);
            if &actual != declared {
                return Err(EngineError::DigestMismatch {
                    expected: declared.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        for layer in &manifest.layers {
            if !self.layers.iter().any(|(d, _)| d == layer) && !store.contains(layer) {
                return Err(EngineError::not_found("layer", layer.to_string()));
            }
        }

        for (_, data) in &self.layers {
            store.put(data)?;
        }
        store.import_manifest(&self.manifest)
    }

    /// Write the bundle as a tar archive.
    pub fn write_tar<W: Write>(&self, writer: W) -> Result<()> {
        let mut builder = tar::Builder::new(writer);
        append(&mut builder, MANIFEST_ENTRY, &self.manifest)?;
        for (digest, data) in &self.layers {
            append(&mut builder, &format!("{}{}", BLOBS_PREFIX, digest.hex()), data)?;
        }
        builder.into_inner()?.flush()?;
        Ok(())
    }

    /// Read a bundle written by [`ImageBundle::write_tar`].
    ///
    /// Layers are ordered as the manifest lists them. Blob names are
    /// trusted only after the bytes are verified on import.
    pub fn read_tar<R: Read>(reader: R) -> Result<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut manifest = None;
        let mut blobs = std::collections::HashMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;

            if path == MANIFEST_ENTRY {
                manifest = Some(data);
            } else if let Some(hex) = path.strip_prefix(BLOBS_PREFIX) {
                let digest: Digest = format!("sha256:{}", hex).parse()?;
                blobs.insert(digest, data);
            } else {
                tracing::debug!(path = %path, "Ignoring unknown bundle entry");
            }
        }

        let manifest = manifest.ok_or_else(|| {
            EngineError::SerializationError(format!("bundle has no {}", MANIFEST_ENTRY))
        })?;
        let parsed = ImageManifest::from_bytes(&manifest)?;
        let layers = parsed
            .layers
            .iter()
            .filter_map(|d| blobs.remove(d).map(|data| (d.clone(), data)))
            .collect();

        Ok(Self { manifest, layers })
    }
}

fn append<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::error::ErrorKind;
    use dockyard_core::ImageConfig;

    fn sample(store: &LayerStore) -> Digest {
        let a = store.put(b"layer-a").unwrap();
        let b = store.put(b"layer-b").unwrap();
        store
            .put_manifest(&ImageManifest::new(vec![a, b], ImageConfig::default(), Vec::new()))
            .unwrap()
    }

    #[test]
    fn test_export_orders_layers() {
        let store = LayerStore::in_memory();
        let digest = sample(&store);
        let bundle = ImageBundle::export(&store, &digest).unwrap();

        assert_eq!(bundle.digest(), digest);
        assert_eq!(bundle.layers[0].1, b"layer-a");
        assert_eq!(bundle.layers[1].1, b"layer-b");
    }

    #[test]
    fn test_import_into_fresh_store() {
        let source = LayerStore::in_memory();
        let digest = sample(&source);
        let bundle = ImageBundle::export(&source, &digest).unwrap();

        let target = LayerStore::in_memory();
        assert_eq!(bundle.import(&target).unwrap(), digest);
        assert_eq!(target.manifest(&digest).unwrap().layers.len(), 2);
    }

    #[test]
    fn test_tampered_layer_is_rejected() {
        let source = LayerStore::in_memory();
        let digest = sample(&source);
        let mut bundle = ImageBundle::export(&source, &digest).unwrap();
        bundle.layers[1].1 = b"evil".to_vec();

        let target = LayerStore::in_memory();
        let err = bundle.import(&target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DigestMismatch);
        assert!(!target.contains(&bundle.layers[0].0));
    }

    #[test]
    fn test_missing_layer_is_rejected() {
        let source = LayerStore::in_memory();
        let digest = sample(&source);
        let mut bundle = ImageBundle::export(&source, &digest).unwrap();
        bundle.layers.pop();

        let err = bundle.import(&LayerStore::in_memory()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_tar_archive() {
        let store = LayerStore::in_memory();
        let digest = sample(&store);
        let bundle = ImageBundle::export(&store, &digest).unwrap();

        let mut archive = Vec::new();
        bundle.write_tar(&mut archive).unwrap();
        let loaded = ImageBundle::read_tar(archive.as_slice()).unwrap();
        assert_eq!(loaded, bundle);

        let mut again = Vec::new();
        loaded.write_tar(&mut again).unwrap();
        assert_eq!(again, archive);
    }

    #[test]
    fn test_tar_without_manifest() {
        let mut archive = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut archive);
            append(&mut builder, "other.txt", b"x").unwrap();
            builder.finish().unwrap();
        }
        assert!(ImageBundle::read_tar(archive.as_slice()).is_err());
    }
}
