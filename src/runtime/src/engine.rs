//! The engine facade.
//!
//! `Engine` owns one instance of every component and exposes the
//! operations a front end needs. Component state starts empty (or is
//! reloaded when `persist` is set); nothing is global.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dockyard_core::error::{EngineError, Result};
use dockyard_core::event::events;
use dockyard_core::{
    BuildInstruction, ContainerConfig, ContainerInspect, ContainerSummary, Digest, EngineConfig,
    EngineEvent, EventEmitter, EventStream, HistoryEntry, ImageSummary, Network, NetworkEndpoint,
    Volume,
};
use tokio::sync::broadcast;

use crate::build::{BuildResult, CommandRunner, Dockerfile, ImageBuilder, ShellRunner};
use crate::bundle::ImageBundle;
use crate::container::{ContainerManager, LogStream};
use crate::network::NetworkManager;
use crate::snapshot::Change;
use crate::store::{normalize_tag, LayerStore, PruneReport};
use crate::volume::VolumeManager;

/// What `remove_image` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageRemoval {
    /// Tags that no longer exist
    pub untagged: Vec<String>,
    /// Blobs physically deleted
    pub deleted: Vec<Digest>,
}

/// A container engine instance.
pub struct Engine {
    config: EngineConfig,
    store: Arc<LayerStore>,
    builder: ImageBuilder,
    containers: ContainerManager,
    volumes: Arc<VolumeManager>,
    networks: Arc<NetworkManager>,
    events: EventEmitter,
}

impl Engine {
    /// Open an engine rooted at `config.home_dir`, running build steps
    /// with the host shell.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(ShellRunner))
    }

    /// Open an engine with a custom runner for `RUN` build steps.
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        std::fs::create_dir_all(&config.home_dir)?;

        let store = Arc::new(LayerStore::open(&config)?);
        let volumes = Arc::new(VolumeManager::open(&config)?);
        let networks = Arc::new(NetworkManager::open(&config)?);
        if !networks.exists(&config.default_network) {
            networks.create(&config.default_network, None)?;
        }

        let events = EventEmitter::new(config.event_capacity);
        let builder = ImageBuilder::new(store.clone(), runner);
        let containers = ContainerManager::new(
            store.clone(),
            volumes.clone(),
            networks.clone(),
            events.clone(),
            &config,
        );

        tracing::info!(
            home = %config.home_dir.display(),
            persist = config.persist,
            images = store.tags().len(),
            volumes = volumes.list().len(),
            networks = networks.list().len(),
            "Engine ready"
        );

        Ok(Self {
            config,
            store,
            builder,
            containers,
            volumes,
            networks,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    // --- images ---

    /// Build an image from `instructions`, resolving COPY sources under `context`.
    pub async fn build(
        &self,
        instructions: &[BuildInstruction],
        context: &Path,
        tag: Option<&str>,
    ) -> Result<BuildResult> {
        let result = self.builder.build(instructions, context, tag).await?;

        let mut fields = vec![("digest", result.digest.to_string())];
        if let Some(tag) = &result.tag {
            fields.push(("tag", tag.clone()));
        }
        self.emit(events::IMAGE_BUILT, &fields);
        if let Some(tag) = &result.tag {
            self.emit(
                events::IMAGE_TAGGED,
                &[("digest", result.digest.to_string()), ("tag", tag.clone())],
            );
        }
        Ok(result)
    }

    /// Parse and build a Dockerfile.
    pub async fn build_dockerfile(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: Option<&str>,
    ) -> Result<BuildResult> {
        let instructions = Dockerfile::from_file(dockerfile)?.into_instructions();
        self.build(&instructions, context, tag).await
    }

    /// Point `name` at the image `reference` resolves to.
    pub fn tag(&self, reference: &str, name: &str) -> Result<Digest> {
        let digest = self.resolve_image(reference)?;
        let name = normalize_tag(name)?;
        self.store.tag(&name, &digest)?;
        self.emit(
            events::IMAGE_TAGGED,
            &[("digest", digest.to_string()), ("tag", name)],
        );
        Ok(digest)
    }

    /// Tagged images and images held by containers, sorted by digest.
    pub fn images(&self) -> Result<Vec<ImageSummary>> {
        let mut tagged: BTreeMap<Digest, Vec<String>> = BTreeMap::new();
        for (name, digest) in self.store.tags() {
            tagged.entry(digest).or_default().push(name);
        }
        for digest in self.containers.image_users().into_keys() {
            tagged.entry(digest).or_default();
        }

        tagged
            .into_iter()
            .map(|(digest, tags)| {
                let manifest = self.store.manifest(&digest)?;
                let size_bytes = manifest
                    .layers
                    .iter()
                    .map(|layer| self.store.size(layer))
                    .sum::<Result<u64>>()?;
                Ok(ImageSummary {
                    digest,
                    tags,
                    layer_count: manifest.layers.len(),
                    size_bytes,
                })
            })
            .collect()
    }

    /// Remove a tag, or every tag of an image when given a digest.
    ///
    /// Fails with `InUse` while a container uses the image unless `force`.
    /// The image and its unshared layers are deleted once it has no tag
    /// and no container.
    pub fn remove_image(&self, reference: &str, force: bool) -> Result<ImageRemoval> {
        let digest = self.resolve_image(reference)?;
        let names = match self.store.resolve_tag(reference) {
            Ok(_) => vec![normalize_tag(reference)?],
            Err(_) => self.store.tags_for(&digest),
        };

        let deleted = self
            .store
            .remove_image(&digest, &names, force)
            .map_err(|e| match e {
                EngineError::InUse { kind, users, .. } => EngineError::InUse {
                    kind,
                    name: reference.to_string(),
                    users,
                },
                EngineError::NotFound { kind: "image", .. } => {
                    EngineError::ImageNotFound(reference.to_string())
                }
                other => other,
            })?;

        for name in &names {
            self.emit(
                events::IMAGE_UNTAGGED,
                &[("digest", digest.to_string()), ("tag", name.clone())],
            );
        }
        let removal = ImageRemoval {
            untagged: names,
            deleted,
        };

        if !removal.deleted.is_empty() {
            self.emit(
                events::IMAGE_REMOVED,
                &[
                    ("digest", digest.to_string()),
                    ("deleted", removal.deleted.len().to_string()),
                ],
            );
        }
        tracing::info!(
            %digest,
            untagged = removal.untagged.len(),
            deleted = removal.deleted.len(),
            "Removed image"
        );
        Ok(removal)
    }

    /// Per-instruction history of an image, oldest first.
    pub fn history(&self, reference: &str) -> Result<Vec<HistoryEntry>> {
        let digest = self.resolve_image(reference)?;
        Ok(self.store.manifest(&digest)?.history)
    }

    /// Bundle an image and its layers for an external registry client.
    pub fn export_image(&self, reference: &str) -> Result<ImageBundle> {
        let digest = self.resolve_image(reference)?;
        ImageBundle::export(&self.store, &digest)
    }

    /// Verify and store a bundle, tagging it when `tag` is given.
    pub fn import_image(&self, bundle: &ImageBundle, tag: Option<&str>) -> Result<Digest> {
        let tag = tag.map(normalize_tag).transpose()?;
        let digest = bundle.import(&self.store)?;
        if let Some(tag) = &tag {
            self.store.tag(tag, &digest)?;
        }

        let mut fields = vec![("digest", digest.to_string())];
        if let Some(tag) = tag {
            fields.push(("tag", tag));
        }
        self.emit(events::IMAGE_IMPORTED, &fields);
        Ok(digest)
    }

    /// Delete every blob no tag and no container holds.
    pub fn prune_images(&self) -> Result<PruneReport> {
        let report = self.store.prune()?;
        self.emit(
            events::IMAGE_PRUNED,
            &[
                ("removed", report.removed.len().to_string()),
                ("reclaimed_bytes", report.reclaimed_bytes.to_string()),
            ],
        );
        Ok(report)
    }

    fn resolve_image(&self, reference: &str) -> Result<Digest> {
        self.store
            .resolve(reference)
            .map_err(|_| EngineError::ImageNotFound(reference.to_string()))
    }

    // --- containers ---

    pub async fn create(&self, image: &str, config: ContainerConfig) -> Result<ContainerInspect> {
        self.containers.create(image, config).await
    }

    /// Create and start a container. A container that fails to start is
    /// left in `created`.
    pub async fn run(&self, image: &str, config: ContainerConfig) -> Result<ContainerInspect> {
        let created = self.containers.create(image, config).await?;
        let id = created.id.to_string();
        self.containers.start(&id).await?;
        self.containers.inspect(&id)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.containers.start(id).await
    }

    /// Stop a container, waiting `timeout` (or the configured grace
    /// period) before killing it.
    pub async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or_else(|| self.config.stop_timeout());
        self.containers.stop(id, timeout).await
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        self.containers.pause(id).await
    }

    pub async fn unpause(&self, id: &str) -> Result<()> {
        self.containers.unpause(id).await
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        self.containers.remove(id, force).await
    }

    pub fn list(&self, all: bool) -> Vec<ContainerSummary> {
        self.containers.list(all)
    }

    pub fn inspect(&self, id: &str) -> Result<ContainerInspect> {
        self.containers.inspect(id)
    }

    pub fn logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        self.containers.logs(id, follow)
    }

    pub async fn wait(&self, id: &str) -> Result<i32> {
        self.containers.wait(id).await
    }

    pub fn diff(&self, id: &str) -> Result<Vec<Change>> {
        self.containers.diff(id)
    }

    pub async fn commit(&self, id: &str, tag: Option<&str>) -> Result<Digest> {
        self.containers.commit(id, tag).await
    }

    // --- volumes ---

    pub fn volume_create(&self, name: &str, labels: BTreeMap<String, String>) -> Result<Volume> {
        let volume = self.volumes.create(name, labels)?;
        self.emit(events::VOLUME_CREATED, &[("name", volume.name.clone())]);
        Ok(volume)
    }

    pub fn volume_remove(&self, name: &str) -> Result<()> {
        self.volumes.remove(name)?;
        self.emit(events::VOLUME_REMOVED, &[("name", name.to_string())]);
        Ok(())
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.volumes.list()
    }

    pub fn volume_inspect(&self, name: &str) -> Result<Volume> {
        self.volumes.get(name)
    }

    /// Remove every volume no container uses.
    pub fn volume_prune(&self) -> Result<Vec<String>> {
        let removed = self.volumes.prune()?;
        for name in &removed {
            self.emit(events::VOLUME_REMOVED, &[("name", name.clone())]);
        }
        Ok(removed)
    }

    // --- networks ---

    /// Create a network; the subnet defaults to the next free one in the pool.
    pub fn network_create(&self, name: &str, subnet: Option<&str>) -> Result<Network> {
        let network = self.networks.create(name, subnet)?;
        self.emit(
            events::NETWORK_CREATED,
            &[("name", network.name.clone()), ("subnet", network.subnet.clone())],
        );
        Ok(network)
    }

    pub fn network_remove(&self, name: &str) -> Result<()> {
        self.networks.remove(name)?;
        self.emit(events::NETWORK_REMOVED, &[("name", name.to_string())]);
        Ok(())
    }

    pub fn networks(&self) -> Vec<Network> {
        self.networks.list()
    }

    pub fn network_inspect(&self, name: &str) -> Result<Network> {
        self.networks.get(name)
    }

    /// Join a container to a network under the container's name.
    pub fn network_connect(&self, network: &str, container: &str) -> Result<NetworkEndpoint> {
        let target = self.containers.inspect(container)?;
        let endpoint = self
            .networks
            .join(target.id.as_str(), &target.name, network)?;
        self.emit(
            events::NETWORK_CONNECTED,
            &[
                ("network", network.to_string()),
                ("container", target.id.to_string()),
                ("ip", endpoint.ip_address.to_string()),
            ],
        );
        Ok(endpoint)
    }

    pub fn network_disconnect(&self, network: &str, container: &str) -> Result<()> {
        let target = self.containers.inspect(container)?;
        self.networks.leave(target.id.as_str(), network)?;
        self.emit(
            events::NETWORK_DISCONNECTED,
            &[
                ("network", network.to_string()),
                ("container", target.id.to_string()),
            ],
        );
        Ok(())
    }

    /// Address `name` has on `network`, as seen by `from_container`.
    pub fn resolve(&self, network: &str, from_container: &str, name: &str) -> Result<Ipv4Addr> {
        let from = self.containers.inspect(from_container)?;
        self.networks.resolve(network, from.id.as_str(), name)
    }

    // --- events ---

    /// Every event emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Events whose domain ("container", "image", ...) is in `domains`.
    pub fn events_for(&self, domains: &[&str]) -> EventStream {
        let domains: BTreeSet<String> = domains.iter().map(|d| d.to_string()).collect();
        self.events
            .subscribe_filtered(move |event| domains.contains(event.domain()))
    }

    /// Stop every container, waiting the configured grace period.
    pub async fn shutdown(&self) {
        tracing::info!(containers = self.containers.len(), "Shutting down engine");
        self.containers.stop_all(self.config.stop_timeout()).await;
    }

    fn emit(&self, key: &str, fields: &[(&str, String)]) {
        let event = fields
            .iter()
            .fold(EngineEvent::new(key), |event, (field, value)| {
                event.with(field, value.as_str())
            });
        self.events.emit(event);
    }
}
