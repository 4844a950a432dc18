//! Container lifecycle manager.
//!
//! Each container is a slot holding its record, its output buffer and the
//! handle of the current run. Transitions on one container are serialized
//! by the slot's async mutex; reads only take the record lock, so
//! `inspect`, `list` and `logs` never wait on a slow `stop`.
//!
//! Entry processes are supervised by one task per run. The supervisor owns
//! the child, pumps its output into the log buffer and publishes the exit
//! code on a watch channel that `stop`, `remove` and `wait` observe.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use dockyard_core::container::generate_name;
use dockyard_core::error::{EngineError, Result};
use dockyard_core::event::events;
use dockyard_core::log::LogStreamKind;
use dockyard_core::volume::is_valid_name;
use dockyard_core::{
    ContainerConfig, ContainerId, ContainerInspect, ContainerState, ContainerSummary, Digest,
    EngineConfig, EngineEvent, EventEmitter, HistoryEntry, ImageManifest, LogConfig, MountInfo,
};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;

use super::logs::{LogBuffer, LogStream};
use super::process::{self, ProcessSpec};
use crate::log::open_log_writer;
use crate::network::NetworkManager;
use crate::snapshot::{normalize_path, Change, LayerDiff, Snapshot};
use crate::store::LayerStore;
use crate::volume::VolumeManager;

/// Path of the generated hosts file inside a rootfs.
const HOSTS_PATH: &str = "etc/hosts";

/// How long output still buffered in the pipes may take to drain once the
/// entry process is gone. A descendant that left the process group can
/// keep a pipe open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the supervisor after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Mutable per-container metadata.
#[derive(Debug, Clone)]
struct ContainerRecord {
    id: ContainerId,
    name: String,
    image: String,
    image_digest: Digest,
    config: ContainerConfig,
    command: Vec<String>,
    env: BTreeMap<String, String>,
    workdir: String,
    state: ContainerState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    mounts: Vec<MountInfo>,
    dir: PathBuf,
    /// Blobs retained for this container (manifest + layers)
    held: Vec<Digest>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            state: self.state,
            command: self.command.clone(),
            created_at: self.created_at,
        }
    }

    /// Snapshot keys hidden from diff and commit.
    fn masked_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .mounts
            .iter()
            .filter_map(|m| normalize_path("/", &m.target).ok())
            .collect();
        paths.push(HOSTS_PATH.to_string());
        paths
    }

    fn invalid(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidState {
            id: self.id.to_string(),
            state: self.state.to_string(),
            operation,
        }
    }
}

/// The current (or last) run of a container.
#[derive(Debug, Clone)]
struct RunHandle {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
}

struct Slot {
    transition: tokio::sync::Mutex<()>,
    record: RwLock<ContainerRecord>,
    logs: Arc<LogBuffer>,
    run: Mutex<Option<RunHandle>>,
}

/// Side effects of a partially provisioned container, undone on failure.
#[derive(Default)]
struct Provisioned {
    held: Vec<Digest>,
    dir: Option<PathBuf>,
    volumes: Vec<String>,
    networks: Vec<String>,
}

/// Manages containers created from images in a [`LayerStore`].
pub struct ContainerManager {
    store: Arc<LayerStore>,
    volumes: Arc<VolumeManager>,
    networks: Arc<NetworkManager>,
    events: EventEmitter,
    containers_dir: PathBuf,
    default_network: String,
    log_config: LogConfig,
    log_buffer_lines: usize,
    slots: DashMap<String, Arc<Slot>>,
    /// name → id
    names: DashMap<String, String>,
}

impl ContainerManager {
    pub fn new(
        store: Arc<LayerStore>,
        volumes: Arc<VolumeManager>,
        networks: Arc<NetworkManager>,
        events: EventEmitter,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            volumes,
            networks,
            events,
            containers_dir: config.containers_dir(),
            default_network: config.default_network.clone(),
            log_config: config.log.clone(),
            log_buffer_lines: config.log_buffer_lines,
            slots: DashMap::new(),
            names: DashMap::new(),
        }
    }

    // --- create ---

    /// Create a container from `image`. Nothing is left behind on failure.
    pub async fn create(&self, image: &str, config: ContainerConfig) -> Result<ContainerInspect> {
        let id = ContainerId::generate();
        let name = self.reserve_name(config.name.as_deref(), &id)?;

        let mut undo = Provisioned::default();
        let record = match self.provision(&id, &name, image, config, &mut undo) {
            Ok(record) => record,
            Err(e) => {
                self.roll_back(&id, undo);
                self.names.remove(&name);
                tracing::debug!(container_id = %id, error = %e, "Create rolled back");
                return Err(e);
            }
        };

        let log_config = record.config.log.clone().unwrap_or_else(|| self.log_config.clone());
        let writer = open_log_writer(&record.dir, &log_config).map_err(|e| {
            EngineError::RuntimeError(format!("failed to open container log: {}", e))
        });
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                self.roll_back(&id, undo);
                self.names.remove(&name);
                return Err(e);
            }
        };

        let slot = Arc::new(Slot {
            transition: tokio::sync::Mutex::new(()),
            record: RwLock::new(record),
            logs: Arc::new(LogBuffer::new(self.log_buffer_lines, writer)),
            run: Mutex::new(None),
        });
        self.slots.insert(id.to_string(), slot.clone());

        tracing::info!(container_id = %id, name = %name, image, "Created container");
        self.emit(events::CONTAINER_CREATED, &id, &name, None);

        let record = slot.record.read().clone();
        Ok(self.inspect_record(&record))
    }

    fn reserve_name(&self, requested: Option<&str>, id: &ContainerId) -> Result<String> {
        if let Some(name) = requested {
            if !is_valid_name(name) {
                return Err(EngineError::ConfigError(format!(
                    "invalid container name '{}'",
                    name
                )));
            }
            return match self.names.entry(name.to_string()) {
                MapEntry::Occupied(_) => Err(EngineError::already_exists("container", name)),
                MapEntry::Vacant(slot) => {
                    slot.insert(id.to_string());
                    Ok(name.to_string())
                }
            };
        }

        let mut attempt = 0;
        loop {
            let name = if attempt < 8 {
                generate_name()
            } else {
                format!("{}_{}", generate_name(), &id.as_str()[..6])
            };
            if let MapEntry::Vacant(slot) = self.names.entry(name.clone()) {
                slot.insert(id.to_string());
                return Ok(name);
            }
            attempt += 1;
        }
    }

    fn provision(
        &self,
        id: &ContainerId,
        name: &str,
        image: &str,
        config: ContainerConfig,
        undo: &mut Provisioned,
    ) -> Result<ContainerRecord> {
        let image_digest = self
            .store
            .resolve(image)
            .map_err(|_| EngineError::ImageNotFound(image.to_string()))?;
        // Held from the moment it resolves, so a concurrent rmi sees it in use
        undo.held = self
            .store
            .hold_image(&image_digest)
            .map_err(|_| EngineError::ImageNotFound(image.to_string()))?;
        let manifest = self
            .store
            .manifest(&image_digest)
            .map_err(|_| EngineError::ImageNotFound(image.to_string()))?;

        let command = config
            .cmd
            .clone()
            .unwrap_or_else(|| manifest.config.command());
        if command.is_empty() {
            return Err(EngineError::ConfigError(format!(
                "no command specified for image {}",
                image
            )));
        }

        let mut mounts = Vec::with_capacity(config.volumes.len());
        for binding in &config.volumes {
            let volume = self.volumes.get(&binding.volume)?;
            let target = normalize_path("/", &binding.target)?;
            if target.is_empty() {
                return Err(EngineError::ConfigError(format!(
                    "volume '{}' cannot be mounted at /",
                    binding.volume
                )));
            }
            mounts.push(MountInfo {
                volume: volume.name,
                source: volume.mount_point,
                target: format!("/{}", target),
                read_only: binding.read_only,
            });
        }

        let mut networks: Vec<String> = Vec::new();
        if config.networks.is_empty() {
            if self.networks.exists(&self.default_network) {
                networks.push(self.default_network.clone());
            }
        } else {
            for network in &config.networks {
                self.networks.get(network)?;
                if !networks.contains(network) {
                    networks.push(network.clone());
                }
            }
        }


        let dir = self.containers_dir.join(id.as_str());
        undo.dir = Some(dir.clone());
        let rootfs = dir.join("rootfs");
        self.compose(&manifest)?.materialize(&rootfs)?;

        for mount in &mounts {
            self.volumes.attach(&mount.volume, id.as_str())?;
            undo.volumes.push(mount.volume.clone());
            bind_volume(&rootfs, mount)?;
        }

        for network in &networks {
            self.networks.join(id.as_str(), name, network)?;
            undo.networks.push(network.clone());
        }

        let mut env = manifest.config.env.clone();
        env.extend(config.env.clone());
        let workdir = match &config.workdir {
            Some(w) => format!("/{}", normalize_path(manifest.config.workdir(), w)?),
            None => manifest.config.workdir().to_string(),
        };

        Ok(ContainerRecord {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            image_digest,
            config,
            command,
            env,
            workdir,
            state: ContainerState::Created,
            pid: None,
            exit_code: None,
            mounts,
            dir,
            held: undo.held.clone(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        })
    }

    fn roll_back(&self, id: &ContainerId, undo: Provisioned) {
        for network in &undo.networks {
            if let Err(e) = self.networks.leave(id.as_str(), network) {
                tracing::warn!(container_id = %id, network, error = %e, "Rollback: leave failed");
            }
        }
        for volume in &undo.volumes {
            if let Err(e) = self.volumes.detach(volume, id.as_str()) {
                tracing::warn!(container_id = %id, volume, error = %e, "Rollback: detach failed");
            }
        }
        if let Some(dir) = &undo.dir {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    tracing::warn!(container_id = %id, error = %e, "Rollback: failed to remove container dir");
                }
            }
        }
        self.store.release(&undo.held);
    }

    // --- lifecycle ---

    /// Start the entry process. `created|stopped` → `running`.
    pub async fn start(&self, id: &str) -> Result<()> {
        let (id, slot) = self.slot(id)?;
        let _transition = slot.transition.lock().await;

        let record = slot.record.read().clone();
        match record.state {
            ContainerState::Created | ContainerState::Stopped => {}
            ContainerState::Running => return Err(EngineError::AlreadyRunning(id)),
            ContainerState::Paused => return Err(record.invalid("start")),
            ContainerState::Removed => return Err(EngineError::not_found("container", id)),
        }

        let rootfs = record.rootfs();
        write_hosts_file(&rootfs, &self.networks.hosts_file(&id))?;

        let child = process::spawn(&ProcessSpec {
            argv: &record.command,
            rootfs: &rootfs,
            workdir: &record.workdir,
            env: &record.env,
        })?;
        let pid = child.id().ok_or_else(|| {
            EngineError::RuntimeError("entry process has no pid".to_string())
        })?;

        let (exit_tx, exit_rx) = watch::channel(None);
        *slot.run.lock() = Some(RunHandle { pid, exit: exit_rx });
        {
            let mut record = slot.record.write();
            record.state = ContainerState::Running;
            record.pid = Some(pid);
            record.exit_code = None;
            record.started_at = Some(Utc::now());
            record.finished_at = None;
        }

        tracing::info!(container_id = %id, pid, command = ?record.command, "Started container");
        self.emit(events::CONTAINER_STARTED, &record.id, &record.name, None);

        tokio::spawn(supervise(slot.clone(), child, exit_tx, self.events.clone()));
        Ok(())
    }

    /// Stop the entry process: SIGTERM, then SIGKILL after `timeout`.
    ///
    /// A container with no process is left as is.
    pub async fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let (id, slot) = self.slot(id)?;
        let _transition = slot.transition.lock().await;

        let (state, cid, name) = {
            let record = slot.record.read();
            (record.state, record.id.clone(), record.name.clone())
        };
        if state == ContainerState::Removed {
            return Err(EngineError::not_found("container", id));
        }
        if !state.has_process() {
            tracing::debug!(container_id = %id, %state, "Stop on container without a process");
            return Ok(());
        }

        let run = slot.run.lock().clone();
        let exit_code = match run {
            Some(run) => terminate(&id, &run, state == ContainerState::Paused, timeout).await?,
            None => None,
        };
        mark_stopped(&slot, exit_code);

        tracing::info!(container_id = %id, exit_code = ?exit_code, "Stopped container");
        self.emit(events::CONTAINER_STOPPED, &cid, &name, exit_code);
        Ok(())
    }

    /// Freeze the entry process. `running` → `paused`.
    pub async fn pause(&self, id: &str) -> Result<()> {
        self.freeze(id, true).await
    }

    /// Resume a frozen entry process. `paused` → `running`.
    pub async fn unpause(&self, id: &str) -> Result<()> {
        self.freeze(id, false).await
    }

    async fn freeze(&self, id: &str, pause: bool) -> Result<()> {
        let (id, slot) = self.slot(id)?;
        let _transition = slot.transition.lock().await;

        let (from, to, signal, operation, event) = if pause {
            (
                ContainerState::Running,
                ContainerState::Paused,
                libc::SIGSTOP,
                "pause",
                events::CONTAINER_PAUSED,
            )
        } else {
            (
                ContainerState::Paused,
                ContainerState::Running,
                libc::SIGCONT,
                "unpause",
                events::CONTAINER_UNPAUSED,
            )
        };

        let record = slot.record.read().clone();
        if record.state != from {
            return Err(record.invalid(operation));
        }
        let pid = slot
            .run
            .lock()
            .as_ref()
            .map(|r| r.pid)
            .ok_or_else(|| record.invalid(operation))?;

        process::signal_group(pid, signal)?;
        {
            let mut current = slot.record.write();
            // The process may have died between the check and the signal
            if current.state == from {
                current.state = to;
            }
        }

        tracing::info!(container_id = %id, operation, "Container {}d", operation);
        self.emit(event, &record.id, &record.name, None);
        Ok(())
    }

    /// Remove a container. Running or paused containers need `force`.
    ///
    /// With `force` the process is killed and its exit awaited before
    /// volumes are detached.
    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let (id, slot) = self.slot(id)?;
        let _transition = slot.transition.lock().await;

        let state = slot.record.read().state;
        match state {
            ContainerState::Removed => return Err(EngineError::not_found("container", id)),
            s if s.has_process() && !force => return Err(EngineError::ContainerRunning(id)),
            s if s.has_process() => {
                let run = slot.run.lock().clone();
                let exit_code = match run {
                    Some(run) => {
                        terminate(&id, &run, s == ContainerState::Paused, Duration::ZERO).await?
                    }
                    None => None,
                };
                mark_stopped(&slot, exit_code);
            }
            _ => {}
        }

        let record = {
            let mut record = slot.record.write();
            record.state = ContainerState::Removed;
            record.clone()
        };

        if let Err(e) = self.networks.leave_all(&id) {
            tracing::warn!(container_id = %id, error = %e, "Failed to leave networks");
        }
        for mount in &record.mounts {
            if let Err(e) = self.volumes.detach(&mount.volume, &id) {
                tracing::warn!(container_id = %id, volume = %mount.volume, error = %e, "Failed to detach volume");
            }
        }
        if record.dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&record.dir) {
                tracing::warn!(container_id = %id, error = %e, "Failed to remove writable layer");
            }
        }
        self.store.release(&record.held);

        slot.logs.close();
        self.slots.remove(&id);
        self.names.remove(&record.name);

        tracing::info!(container_id = %id, name = %record.name, "Removed container");
        self.emit(events::CONTAINER_REMOVED, &record.id, &record.name, None);
        Ok(())
    }

    /// Stop every container with a process. Used on engine shutdown.
    pub async fn stop_all(&self, timeout: Duration) {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter(|s| s.record.read().state.has_process())
            .map(|s| s.key().clone())
            .collect();
        let stops = ids.iter().map(|id| self.stop(id, timeout));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                tracing::warn!(container_id = %id, error = %e, "Failed to stop container on shutdown");
            }
        }
    }

    // --- queries ---

    pub fn inspect(&self, id: &str) -> Result<ContainerInspect> {
        let (_, slot) = self.slot(id)?;
        let record = slot.record.read().clone();
        Ok(self.inspect_record(&record))
    }

    /// Containers sorted by creation time; only live ones unless `all`.
    pub fn list(&self, all: bool) -> Vec<ContainerSummary> {
        let mut summaries: Vec<ContainerSummary> = self
            .slots
            .iter()
            .map(|s| s.record.read().summary())
            .filter(|s| all || s.state.has_process())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    /// Output of a container; live lines follow the history when `follow`.
    pub fn logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        let (_, slot) = self.slot(id)?;
        Ok(slot.logs.stream(follow))
    }

    /// Exit code of the current run, waiting for it to finish.
    pub async fn wait(&self, id: &str) -> Result<i32> {
        let (id, slot) = self.slot(id)?;
        let run = slot.run.lock().clone();
        match run {
            Some(run) => wait_exit(run.exit).await.ok_or_else(|| {
                EngineError::RuntimeError(format!(
                    "supervisor for container {} ended without an exit status",
                    id
                ))
            }),
            None => {
                let record = slot.record.read();
                record.exit_code.ok_or_else(|| record.invalid("wait"))
            }
        }
    }

    /// Changes in the writable layer relative to the image.
    pub fn diff(&self, id: &str) -> Result<Vec<Change>> {
        let (_, slot) = self.slot(id)?;
        let record = slot.record.read().clone();
        let (base, after) = self.writable_layer(&record)?;
        Ok(base.changes(&after))
    }

    /// Create an image from the container's writable layer.
    pub async fn commit(&self, id: &str, tag: Option<&str>) -> Result<Digest> {
        let (id, slot) = self.slot(id)?;
        let _transition = slot.transition.lock().await;
        let record = slot.record.read().clone();
        if record.state == ContainerState::Removed {
            return Err(EngineError::not_found("container", id));
        }

        let manifest = self.store.manifest(&record.image_digest)?;
        let (base, after) = self.writable_layer(&record)?;
        let diff = base.diff(&after);

        let mut layers = manifest.layers.clone();
        if !diff.is_empty() {
            layers.push(self.store.put(&diff.encode()?)?);
        }
        let mut history = manifest.history.clone();
        history.push(HistoryEntry {
            created_by: format!("commit {}", record.id),
            empty_layer: diff.is_empty(),
        });

        let mut config = manifest.config.clone();
        config.env = record.env.clone();
        config.working_dir = Some(record.workdir.clone());
        if let Some(cmd) = &record.config.cmd {
            config.entrypoint = None;
            config.cmd = Some(cmd.clone());
        }

        let digest = self
            .store
            .put_manifest(&ImageManifest::new(layers, config, history))?;
        if let Some(tag) = tag {
            self.store.tag(tag, &digest)?;
        }

        tracing::info!(container_id = %id, %digest, changes = diff.puts.len() + diff.deletes.len(), "Committed container");
        self.events.emit(
            subject_event(events::CONTAINER_COMMITTED, &record.id, &record.name)
                .with("digest", digest.to_string()),
        );
        Ok(digest)
    }

    /// Image ids held by containers, with how many containers hold each.
    pub fn image_users(&self) -> HashMap<Digest, usize> {
        let mut users = HashMap::new();
        for slot in self.slots.iter() {
            *users.entry(slot.record.read().image_digest.clone()).or_insert(0) += 1;
        }
        users
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // --- helpers ---

    /// Look a container up by id, name or unique id prefix.
    fn slot(&self, reference: &str) -> Result<(String, Arc<Slot>)> {
        if let Some(slot) = self.slots.get(reference) {
            return Ok((reference.to_string(), slot.value().clone()));
        }
        if let Some(id) = self.names.get(reference).map(|id| id.value().clone()) {
            if let Some(slot) = self.slots.get(&id) {
                return Ok((id, slot.value().clone()));
            }
        }

        if !reference.is_empty() && reference.chars().all(|c| c.is_ascii_hexdigit()) {
            let mut matches = self.slots.iter().filter(|s| s.key().starts_with(reference));
            if let Some(first) = matches.next() {
                if matches.next().is_some() {
                    return Err(EngineError::Other(format!(
                        "ambiguous container reference '{}'",
                        reference
                    )));
                }
                return Ok((first.key().clone(), first.value().clone()));
            }
        }
        Err(EngineError::not_found("container", reference))
    }

    fn compose(&self, manifest: &ImageManifest) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for layer in &manifest.layers {
            snapshot.apply(&LayerDiff::decode(&self.store.get(layer)?)?);
        }
        Ok(snapshot)
    }

    /// Image tree and current writable tree, with engine-managed paths hidden.
    fn writable_layer(&self, record: &ContainerRecord) -> Result<(Snapshot, Snapshot)> {
        let base = self.compose(&self.store.manifest(&record.image_digest)?)?;
        let mut after = Snapshot::capture(&record.rootfs())?;
        let masked = record.masked_paths();
        after.mask(&base, &masked);
        prune_scaffolding(&mut after, &base, &masked);
        Ok((base, after))
    }

    fn inspect_record(&self, record: &ContainerRecord) -> ContainerInspect {
        ContainerInspect {
            id: record.id.clone(),
            name: record.name.clone(),
            image: record.image.clone(),
            image_digest: record.image_digest.clone(),
            state: record.state,
            pid: record.pid,
            exit_code: record.exit_code,
            command: record.command.clone(),
            config: record.config.clone(),
            mounts: record.mounts.clone(),
            networks: self.networks.endpoints_for(record.id.as_str()),
            rootfs: record.rootfs(),
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }

    fn emit(&self, key: &str, id: &ContainerId, name: &str, exit_code: Option<i32>) {
        let mut event = subject_event(key, id, name);
        if let Some(code) = exit_code {
            event = event.with("exit_code", code);
        }
        self.events.emit(event);
    }
}

fn subject_event(key: &str, id: &ContainerId, name: &str) -> EngineEvent {
    EngineEvent::new(key).with("id", id.as_str()).with("name", name)
}

/// Own the child until it exits, then publish its exit code.
async fn supervise(
    slot: Arc<Slot>,
    mut child: Child,
    exit: watch::Sender<Option<i32>>,
    emitter: EventEmitter,
) {
    let pid = child.id();
    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, LogStreamKind::Stdout, slot.logs.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, LogStreamKind::Stderr, slot.logs.clone())));
    }

    let code = match child.wait().await {
        Ok(status) => process::exit_code(&status),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for entry process");
            -1
        }
    };

    // Nothing in the container outlives its entry process
    if let Some(pid) = pid {
        let _ = process::signal_group(pid, libc::SIGKILL);
    }
    let aborts: Vec<_> = pumps.iter().map(|p| p.abort_handle()).collect();
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(pumps)).await;
    if drained.is_err() {
        tracing::warn!(pid = ?pid, "Output pipes still open after exit, detaching");
        for abort in aborts {
            abort.abort();
        }
    }

    let (id, name) = {
        let mut record = slot.record.write();
        if record.state.has_process() {
            record.state = ContainerState::Stopped;
        }
        record.pid = None;
        record.exit_code = Some(code);
        record.finished_at = Some(Utc::now());
        (record.id.clone(), record.name.clone())
    };

    tracing::info!(container_id = %id, exit_code = code, "Container exited");
    emitter.emit(subject_event(events::CONTAINER_DIED, &id, &name).with("exit_code", code));

    let _ = exit.send(Some(code));
}

/// Copy lines from `reader` into the log buffer until EOF.
async fn pump<R: AsyncRead + Unpin>(reader: R, stream: LogStreamKind, logs: Arc<LogBuffer>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                logs.push(stream, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                tracing::debug!(%stream, error = %e, "Output pipe closed");
                break;
            }
        }
    }
}

/// Signal the process group and wait for the run to exit.
///
/// SIGTERM first; SIGKILL once `grace` elapses. A paused group is resumed
/// so it can handle the signal.
async fn terminate(
    id: &str,
    run: &RunHandle,
    paused: bool,
    grace: Duration,
) -> Result<Option<i32>> {
    if let Some(code) = *run.exit.borrow() {
        return Ok(Some(code));
    }

    process::signal_group(run.pid, libc::SIGTERM)?;
    if paused {
        process::signal_group(run.pid, libc::SIGCONT)?;
    }

    match tokio::time::timeout(grace, wait_exit(run.exit.clone())).await {
        Ok(code) => Ok(code),
        Err(_) => {
            tracing::warn!(container_id = id, pid = run.pid, grace_ms = grace.as_millis() as u64, "Container did not exit in time, sending SIGKILL");
            process::signal_group(run.pid, libc::SIGKILL)?;
            match tokio::time::timeout(KILL_WAIT, wait_exit(run.exit.clone())).await {
                Ok(code) => Ok(code),
                Err(_) => {
                    tracing::error!(container_id = id, pid = run.pid, "Entry process survived SIGKILL");
                    Ok(None)
                }
            }
        }
    }
}

async fn wait_exit(mut exit: watch::Receiver<Option<i32>>) -> Option<i32> {
    loop {
        let current = *exit.borrow_and_update();
        if current.is_some() {
            return current;
        }
        if exit.changed().await.is_err() {
            return *exit.borrow();
        }
    }
}

fn mark_stopped(slot: &Slot, exit_code: Option<i32>) {
    let mut record = slot.record.write();
    if record.state.has_process() {
        record.state = ContainerState::Stopped;
    }
    if exit_code.is_some() {
        record.exit_code = exit_code;
    }
    record.pid = None;
}

/// Expose a volume at its target through a symlink in the rootfs.
fn bind_volume(rootfs: &Path, mount: &MountInfo) -> Result<()> {
    let target = rootfs.join(mount.target.trim_start_matches('/'));
    if let Ok(meta) = std::fs::symlink_metadata(&target) {
        if meta.is_dir() {
            std::fs::remove_dir_all(&target)?;
        } else {
            std::fs::remove_file(&target)?;
        }
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(&mount.source, &target)?;
    Ok(())
}

fn write_hosts_file(rootfs: &Path, content: &str) -> Result<()> {
    let path = rootfs.join(HOSTS_PATH);
    if let Ok(meta) = std::fs::symlink_metadata(&path) {
        if meta.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    Ok(())
}

/// Drop directories that only exist to hold masked paths.
fn prune_scaffolding(after: &mut Snapshot, base: &Snapshot, masked: &[String]) {
    for path in masked {
        let mut current = path.as_str();
        while let Some((parent, _)) = current.rsplit_once('/') {
            if base.get(parent).is_some() {
                break;
            }
            let prefix = format!("{}/", parent);
            if after.entries().keys().any(|k| k.starts_with(&prefix)) {
                break;
            }
            after.remove(parent);
            current = parent;
        }
    }
}
