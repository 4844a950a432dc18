//! Content-addressed layer and manifest store.
//!
//! Blobs (layer archives and image manifests) are keyed by the SHA-256 of
//! their bytes. Every stored manifest holds each of its layers for as long
//! as the manifest exists. A manifest is in turn held by its tags and by
//! the containers created from it. Tags and holds never delete anything:
//! blobs only go away through [`LayerStore::delete_image`] and
//! [`LayerStore::prune`], and only once nothing refers to them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dockyard_core::error::{EngineError, Result};
use dockyard_core::{Digest, EngineConfig, ImageManifest};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::backend::{BlobBackend, DiskBackend, MemoryBackend};
use crate::persist::JsonFile;

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageIndex {
    tags: BTreeMap<String, Digest>,
    #[serde(default)]
    manifests: BTreeSet<Digest>,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Tag → manifest digest
    tags: BTreeMap<String, Digest>,
    /// Manifest digest → its distinct layers
    manifests: HashMap<Digest, Vec<Digest>>,
    /// Blob digest → holders
    refs: HashMap<Digest, usize>,
}

impl StoreState {
    fn tag_count(&self, digest: &Digest) -> usize {
        self.tags.values().filter(|d| *d == digest).count()
    }

    fn holders(&self, digest: &Digest) -> usize {
        self.refs.get(digest).copied().unwrap_or(0)
    }

    fn hold(&mut self, digest: &Digest) {
        *self.refs.entry(digest.clone()).or_insert(0) += 1;
    }

    fn unhold(&mut self, digest: &Digest) {
        if let Some(count) = self.refs.get_mut(digest) {
            *count -= 1;
            if *count == 0 {
                self.refs.remove(digest);
            }
        }
    }

    /// Record a manifest and take its layer holds. False if already known.
    fn register(&mut self, digest: &Digest, manifest: &ImageManifest) -> bool {
        if self.manifests.contains_key(digest) {
            return false;
        }
        let mut layers: Vec<Digest> = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            if !layers.contains(layer) {
                layers.push(layer.clone());
            }
        }
        for layer in &layers {
            self.hold(layer);
        }
        self.manifests.insert(digest.clone(), layers);
        true
    }
}

/// Outcome of a [`LayerStore::prune`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: Vec<Digest>,
    pub reclaimed_bytes: u64,
}

/// Content-addressed blob store with tags and reference counting.
pub struct LayerStore {
    backend: Box<dyn BlobBackend>,
    state: RwLock<StoreState>,
    index: Option<JsonFile<ImageIndex>>,
}

impl LayerStore {
    /// Empty store kept entirely in memory.
    pub fn in_memory() -> Self {
        Self::with_backend(Box::new(MemoryBackend::new()))
    }

    /// Empty, non-persistent store over an arbitrary backend.
    pub fn with_backend(backend: Box<dyn BlobBackend>) -> Self {
        Self {
            backend,
            state: RwLock::new(StoreState::default()),
            index: None,
        }
    }

    /// Open the store described by `config`.
    ///
    /// With `persist`, blobs live under `<home>/blobs` and the manifest
    /// and tag index is reloaded from `<home>/images.json`; otherwise the
    /// store starts empty in memory.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        if !config.persist {
            return Ok(Self::in_memory());
        }

        let backend = DiskBackend::new(&config.blobs_dir())?;
        let index = JsonFile::<ImageIndex>::new(config.images_file());
        let loaded = index.load()?;

        let store = Self {
            backend: Box::new(backend),
            state: RwLock::new(StoreState::default()),
            index: Some(index),
        };

        {
            let mut state = store.state.write();
            let known = loaded.manifests.iter().chain(loaded.tags.values());
            for digest in known {
                match store.manifest(digest) {
                    Ok(manifest) => {
                        state.register(digest, &manifest);
                    }
                    Err(e) => tracing::warn!(%digest, error = %e, "Dropping missing manifest"),
                }
            }
            for (name, digest) in loaded.tags {
                if !state.manifests.contains_key(&digest) {
                    tracing::warn!(tag = %name, %digest, "Dropping dangling tag");
                    continue;
                }
                if state.tag_count(&digest) == 0 {
                    state.hold(&digest);
                }
                state.tags.insert(name, digest);
            }
            tracing::debug!(
                tags = state.tags.len(),
                manifests = state.manifests.len(),
                "Loaded image index"
            );
        }

        Ok(store)
    }

    // --- blobs ---

    /// Store bytes and return their digest. Idempotent.
    pub fn put(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        self.backend.write(&digest, data)?;
        tracing::trace!(%digest, size = data.len(), "Stored blob");
        Ok(digest)
    }

    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.backend
            .read(digest)?
            .ok_or_else(|| EngineError::not_found("blob", digest.to_string()))
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.backend.exists(digest)
    }

    pub fn size(&self, digest: &Digest) -> Result<u64> {
        self.backend
            .len(digest)
            .ok_or_else(|| EngineError::not_found("blob", digest.to_string()))
    }

    // --- manifests ---

    /// Store a manifest. From here on it holds its layers.
    pub fn put_manifest(&self, manifest: &ImageManifest) -> Result<Digest> {
        self.store_manifest(&manifest.to_bytes()?, manifest)
    }

    /// Store manifest bytes exactly as given, e.g. from an image bundle.
    pub fn import_manifest(&self, bytes: &[u8]) -> Result<Digest> {
        let manifest = ImageManifest::from_bytes(bytes)?;
        self.store_manifest(bytes, &manifest)
    }

    fn store_manifest(&self, bytes: &[u8], manifest: &ImageManifest) -> Result<Digest> {
        let digest = self.put(bytes)?;
        if self.state.write().register(&digest, manifest) {
            tracing::debug!(%digest, layers = manifest.layers.len(), "Registered manifest");
            self.save_index()?;
        }
        Ok(digest)
    }

    /// Load the manifest stored under `digest`.
    pub fn manifest(&self, digest: &Digest) -> Result<ImageManifest> {
        let data = self.get(digest)?;
        ImageManifest::from_bytes(&data)
            .map_err(|_| EngineError::not_found("manifest", digest.to_string()))
    }

    /// Hold a stored image and its layers in one step.
    ///
    /// Returns the held digests for a later [`LayerStore::release`].
    /// Fails with `NotFound` if the image is gone.
    pub fn hold_image(&self, digest: &Digest) -> Result<Vec<Digest>> {
        let mut state = self.state.write();
        let layers = state
            .manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| EngineError::not_found("image", digest.to_string()))?;
        let mut refs = Vec::with_capacity(layers.len() + 1);
        refs.push(digest.clone());
        refs.extend(layers);
        for d in &refs {
            state.hold(d);
        }
        Ok(refs)
    }

    // --- tags ---

    /// Point `name` at a stored manifest, replacing any previous target.
    ///
    /// The previous target is left in place, untagged.
    pub fn tag(&self, name: &str, digest: &Digest) -> Result<()> {
        let name = normalize_tag(name)?;

        let previous = {
            let mut state = self.state.write();
            if !state.manifests.contains_key(digest) {
                return Err(EngineError::not_found("manifest", digest.to_string()));
            }
            if state.tags.get(&name) == Some(digest) {
                return Ok(());
            }
            if state.tag_count(digest) == 0 {
                state.hold(digest);
            }
            let previous = state.tags.insert(name.clone(), digest.clone());
            if let Some(old) = &previous {
                if state.tag_count(old) == 0 {
                    state.unhold(old);
                }
            }
            previous
        };

        tracing::info!(tag = %name, %digest, previous = ?previous.map(|d| d.short().to_string()), "Tagged image");
        self.save_index()
    }

    pub fn resolve_tag(&self, name: &str) -> Result<Digest> {
        let name = normalize_tag(name)?;
        self.state
            .read()
            .tags
            .get(&name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("tag", name))
    }

    /// Remove a tag and return the digest it pointed to.
    pub fn untag(&self, name: &str) -> Result<Digest> {
        let name = normalize_tag(name)?;
        let digest = {
            let mut state = self.state.write();
            let digest = state
                .tags
                .remove(&name)
                .ok_or_else(|| EngineError::not_found("tag", name.clone()))?;
            if state.tag_count(&digest) == 0 {
                state.unhold(&digest);
            }
            digest
        };

        tracing::info!(tag = %name, %digest, "Untagged image");
        self.save_index()?;
        Ok(digest)
    }

    /// All tags, sorted by name.
    pub fn tags(&self) -> Vec<(String, Digest)> {
        self.state
            .read()
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Tags currently pointing at `digest`, sorted.
    pub fn tags_for(&self, digest: &Digest) -> Vec<String> {
        self.state
            .read()
            .tags
            .iter()
            .filter(|(_, d)| *d == digest)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Resolve a tag, a full digest, or an unambiguous digest prefix.
    pub fn resolve(&self, reference: &str) -> Result<Digest> {
        if let Ok(digest) = self.resolve_tag(reference) {
            return Ok(digest);
        }

        if let Ok(digest) = reference.parse::<Digest>() {
            return if self.contains(&digest) {
                Ok(digest)
            } else {
                Err(EngineError::not_found("image", reference))
            };
        }

        let prefix = reference.strip_prefix("sha256:").unwrap_or(reference);
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::not_found("image", reference));
        }

        let mut matches = self
            .backend
            .list()?
            .into_iter()
            .filter(|d| d.hex().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(digest), None) => Ok(digest),
            (Some(_), Some(_)) => Err(EngineError::Other(format!(
                "ambiguous reference '{}' matches multiple digests",
                reference
            ))),
            (None, _) => Err(EngineError::not_found("image", reference)),
        }
    }

    // --- reference counting ---

    /// Add one hold on each digest.
    pub fn retain(&self, digests: &[Digest]) {
        let mut state = self.state.write();
        for d in digests {
            state.hold(d);
        }
    }

    /// Drop one hold on each digest. Nothing is deleted here.
    pub fn release(&self, digests: &[Digest]) {
        let mut state = self.state.write();
        for d in digests {
            state.unhold(d);
        }
    }

    pub fn ref_count(&self, digest: &Digest) -> usize {
        self.state.read().holders(digest)
    }

    /// Holds that last until the returned lease is dropped.
    pub fn lease(self: &Arc<Self>) -> Lease {
        Lease {
            store: Arc::clone(self),
            held: Vec::new(),
        }
    }

    /// Delete untagged images nothing holds, then every blob nothing
    /// refers to.
    pub fn prune(&self) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        {
            let mut state = self.state.write();
            let dangling: Vec<Digest> = state
                .manifests
                .keys()
                .filter(|d| state.holders(d) == 0)
                .cloned()
                .collect();
            for digest in &dangling {
                self.forget_manifest(&mut state, digest);
            }

            for digest in self.backend.list()? {
                if state.holders(&digest) > 0 || state.manifests.contains_key(&digest) {
                    continue;
                }
                let size = self.backend.len(&digest).unwrap_or(0);
                if self.backend.delete(&digest)? {
                    report.reclaimed_bytes += size;
                    report.removed.push(digest);
                }
            }
        }
        report.removed.sort();
        tracing::info!(
            removed = report.removed.len(),
            bytes = report.reclaimed_bytes,
            "Pruned unreferenced blobs"
        );
        self.save_index()?;
        Ok(report)
    }

    /// Delete an untagged image nothing holds, along with the layers no
    /// other image refers to.
    pub fn delete_image(&self, digest: &Digest) -> Result<Vec<Digest>> {
        let deleted = {
            let mut state = self.state.write();
            self.delete_locked(&mut state, digest)?
        };
        tracing::info!(%digest, deleted = deleted.len(), "Deleted image");
        self.save_index()?;
        Ok(deleted)
    }

    /// Drop `tags` from an image, then delete it if no tag and nothing
    /// else holds it. One lock covers the whole step, so a concurrent
    /// [`LayerStore::hold_image`] either lands first and keeps the image,
    /// or fails with `NotFound`.
    ///
    /// Without `force`, holds other than tags fail the call with `InUse`
    /// before anything changes. Returns the blobs deleted.
    pub fn remove_image(&self, digest: &Digest, tags: &[String], force: bool) -> Result<Vec<Digest>> {
        let deleted = {
            let mut state = self.state.write();
            if !state.manifests.contains_key(digest) {
                return Err(EngineError::not_found("image", digest.to_string()));
            }
            let tag_hold = usize::from(state.tag_count(digest) > 0);
            let users = state.holders(digest).saturating_sub(tag_hold);
            if users > 0 && !force {
                return Err(EngineError::InUse {
                    kind: "image",
                    name: digest.to_string(),
                    users,
                });
            }
            if let Some(missing) = tags.iter().find(|t| state.tags.get(*t) != Some(digest)) {
                return Err(EngineError::not_found("tag", missing.clone()));
            }

            for tag in tags {
                state.tags.remove(tag);
            }
            if tag_hold > 0 && state.tag_count(digest) == 0 {
                state.unhold(digest);
            }
            if state.holders(digest) == 0 {
                self.delete_locked(&mut state, digest)?
            } else {
                Vec::new()
            }
        };

        tracing::info!(%digest, untagged = tags.len(), deleted = deleted.len(), "Removed image");
        self.save_index()?;
        Ok(deleted)
    }

    fn delete_locked(&self, state: &mut StoreState, digest: &Digest) -> Result<Vec<Digest>> {
        let Some(layers) = self.forget_checked(state, digest)? else {
            return Err(EngineError::not_found("image", digest.to_string()));
        };
        let mut deleted = Vec::new();
        if self.backend.delete(digest)? {
            deleted.push(digest.clone());
        }
        for layer in layers {
            if state.holders(&layer) == 0 && self.backend.delete(&layer)? {
                deleted.push(layer);
            }
        }
        Ok(deleted)
    }

    /// Unregister `digest` unless something still holds it.
    fn forget_checked(&self, state: &mut StoreState, digest: &Digest) -> Result<Option<Vec<Digest>>> {
        let holders = state.holders(digest);
        if holders > 0 {
            return Err(EngineError::InUse {
                kind: "image",
                name: digest.to_string(),
                users: holders,
            });
        }
        Ok(self.forget_manifest(state, digest))
    }

    /// Drop a manifest's registration and its layer holds.
    fn forget_manifest(&self, state: &mut StoreState, digest: &Digest) -> Option<Vec<Digest>> {
        let layers = state.manifests.remove(digest)?;
        for layer in &layers {
            state.unhold(layer);
        }
        Some(layers)
    }

    fn save_index(&self) -> Result<()> {
        if let Some(index) = &self.index {
            let snapshot = {
                let state = self.state.read();
                ImageIndex {
                    tags: state.tags.clone(),
                    manifests: state.manifests.keys().cloned().collect(),
                }
            };
            index.save(&snapshot)?;
        }
        Ok(())
    }
}

/// Temporary holds on blobs, released on drop.
///
/// A build keeps the layers it produces or reuses leased until its
/// manifest is stored and tagged, so a concurrent prune cannot take them.
pub struct Lease {
    store: Arc<LayerStore>,
    held: Vec<Digest>,
}

impl Lease {
    pub fn hold(&mut self, digest: &Digest) {
        self.store.retain(std::slice::from_ref(digest));
        self.held.push(digest.clone());
    }

    /// Hold an image and its layers; `NotFound` if it is gone.
    pub fn hold_image(&mut self, digest: &Digest) -> Result<()> {
        let refs = self.store.hold_image(digest)?;
        self.held.extend(refs);
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.store.release(&self.held);
    }
}

/// Canonical tag form: `name:version`, defaulting the version to `latest`.
pub fn normalize_tag(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) || name.starts_with("sha256:") {
        return Err(EngineError::Other(format!("invalid tag '{}'", name)));
    }
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        Ok(name.to_string())
    } else {
        Ok(format!("{}:latest", name))
    }
}
