//! Build engine for constructing images from instructions.
//!
//! Walks the instructions in order against an accumulating filesystem
//! snapshot. COPY and RUN produce layers; everything else only touches
//! image metadata. Each step has a cache key chained from the previous
//! one, so an unchanged prefix of a build is replayed from the store
//! without executing anything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dockyard_core::error::{EngineError, Result};
use dockyard_core::image::SCRATCH;
use dockyard_core::{BuildInstruction, Digest, HistoryEntry, ImageConfig, ImageManifest};
use parking_lot::Mutex;
use serde::Serialize;

use super::runner::{CommandRunner, RunRequest};
use crate::snapshot::{content_digest, normalize_path, LayerDiff, Snapshot};
use crate::store::{normalize_tag, LayerStore, Lease};

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Manifest digest (the image id)
    pub digest: Digest,
    /// Layer sequence, base layers first
    pub layers: Vec<Digest>,
    /// Filesystem steps replayed from the cache
    pub cache_hits: usize,
    /// Filesystem steps that had to execute
    pub cache_misses: usize,
    /// Tag applied, if one was requested
    pub tag: Option<String>,
}

/// Mutable state accumulated during the build.
struct BuildState {
    snapshot: Snapshot,
    config: ImageConfig,
    layers: Vec<Digest>,
    history: Vec<HistoryEntry>,
    /// Cache key of the last step
    parent_key: String,
    cache_hits: usize,
    cache_misses: usize,
    /// Keeps the base image and every produced layer alive until the
    /// build is over
    lease: Lease,
}

impl BuildState {
    fn scratch(lease: Lease) -> Self {
        Self {
            snapshot: Snapshot::new(),
            config: ImageConfig::default(),
            layers: Vec::new(),
            history: Vec::new(),
            parent_key: SCRATCH.to_string(),
            cache_hits: 0,
            cache_misses: 0,
            lease,
        }
    }

    fn workdir(&self) -> String {
        self.config.workdir().to_string()
    }
}

/// Canonical content hashed into a step's cache key.
#[derive(Serialize)]
struct StepKey<'a> {
    instruction: &'a BuildInstruction,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workdir: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a std::collections::BTreeMap<String, String>>,
}

/// Builds images into a [`LayerStore`], caching filesystem steps.
pub struct ImageBuilder {
    store: Arc<LayerStore>,
    runner: Arc<dyn CommandRunner>,
    /// Step key → produced layer (None for steps that changed nothing)
    cache: Mutex<HashMap<Digest, Option<Digest>>>,
}

impl ImageBuilder {
    pub fn new(store: Arc<LayerStore>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            store,
            runner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of remembered step results.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Execute `instructions` with COPY sources resolved under `context`.
    ///
    /// The image is only tagged when every instruction succeeded.
    pub async fn build(
        &self,
        instructions: &[BuildInstruction],
        context: &Path,
        tag: Option<&str>,
    ) -> Result<BuildResult> {
        let tag = tag.map(normalize_tag).transpose()?;
        let mut state = BuildState::scratch(self.store.lease());
        let total = instructions.len();

        for (index, instruction) in instructions.iter().enumerate() {
            tracing::info!(
                step = index + 1,
                total,
                instruction = %instruction.describe(),
                "Build step"
            );
            self.execute(&mut state, index, instruction, context).await?;
        }

        let manifest = ImageManifest::new(state.layers.clone(), state.config, state.history);
        let bytes = manifest.to_bytes()?;
        state.lease.hold(&Digest::of(&bytes));
        let digest = self.store.import_manifest(&bytes)?;
        if let Some(tag) = &tag {
            self.store.tag(tag, &digest)?;
        }

        tracing::info!(
            %digest,
            layers = state.layers.len(),
            cache_hits = state.cache_hits,
            cache_misses = state.cache_misses,
            tag = ?tag,
            "Build complete"
        );

        Ok(BuildResult {
            digest,
            layers: state.layers,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            tag,
        })
    }

    async fn execute(
        &self,
        state: &mut BuildState,
        index: usize,
        instruction: &BuildInstruction,
        context: &Path,
    ) -> Result<()> {
        match instruction {
            BuildInstruction::SetBase { image } => {
                if index != 0 {
                    return Err(EngineError::build(
                        index,
                        "SetBase is only allowed as the first instruction",
                    ));
                }
                self.apply_base(state, index, image)?;
                state.history.push(HistoryEntry {
                    created_by: instruction.describe(),
                    empty_layer: true,
                });
                return Ok(());
            }

            BuildInstruction::CopyFiles { src, dst } => {
                let source = resolve_source(context, src)
                    .map_err(|e| EngineError::build(index, e))?;
                let source_digest =
                    content_digest(&source).map_err(|e| EngineError::build(index, e))?;
                let key = self.step_key(
                    state,
                    &StepKey {
                        instruction,
                        source: Some(&source_digest),
                        workdir: Some(&state.workdir()),
                        env: None,
                    },
                )?;

                if !self.replay(state, &key, instruction)? {
                    let dst = absolute_in(&state.workdir(), dst);
                    let mut after = state.snapshot.clone();
                    after
                        .copy_in(&source, &dst)
                        .map_err(|e| EngineError::build(index, e))?;
                    self.commit_step(state, key, after, instruction)?;
                }
                return Ok(());
            }

            BuildInstruction::RunCommand { command } => {
                let workdir = state.workdir();
                let key = self.step_key(
                    state,
                    &StepKey {
                        instruction,
                        source: None,
                        workdir: Some(&workdir),
                        env: Some(&state.config.env),
                    },
                )?;

                if !self.replay(state, &key, instruction)? {
                    let request = RunRequest {
                        command: command.clone(),
                        workdir,
                        env: state.config.env.clone(),
                    };
                    let after = self
                        .runner
                        .run(&state.snapshot, &request)
                        .await
                        .map_err(|e| EngineError::build(index, e))?;
                    self.commit_step(state, key, after, instruction)?;
                }
                return Ok(());
            }

            BuildInstruction::SetEntrypoint { command } => {
                state.config.entrypoint = Some(command.clone());
            }
            BuildInstruction::SetCmd { command } => {
                state.config.cmd = Some(command.clone());
            }
            BuildInstruction::ExposePort { port } => {
                state.config.exposed_ports.insert(*port);
            }
            BuildInstruction::SetEnv { key, value } => {
                state.config.env.insert(key.clone(), value.clone());
            }
            BuildInstruction::SetWorkdir { path } => {
                let resolved = absolute_in(&state.workdir(), path);
                let normalized = normalize_path("/", &resolved)
                    .map_err(|e| EngineError::build(index, e))?;
                state.config.working_dir = Some(format!("/{}", normalized));
            }
            BuildInstruction::SetLabel { key, value } => {
                state.config.labels.insert(key.clone(), value.clone());
            }
        }

        // Metadata-only steps still advance the key chain
        let key = self.step_key(
            state,
            &StepKey {
                instruction,
                source: None,
                workdir: None,
                env: None,
            },
        )?;
        state.parent_key = key.to_string();
        state.history.push(HistoryEntry {
            created_by: instruction.describe(),
            empty_layer: true,
        });
        Ok(())
    }

    /// Load a base image's filesystem and metadata into `state`.
    fn apply_base(&self, state: &mut BuildState, index: usize, image: &str) -> Result<()> {
        if image == SCRATCH {
            return Ok(());
        }

        let not_found =
            |_: EngineError| EngineError::build(index, EngineError::ImageNotFound(image.to_string()));
        let digest = self.store.resolve(image).map_err(not_found)?;
        state.lease.hold_image(&digest).map_err(not_found)?;
        let manifest = self.store.manifest(&digest).map_err(not_found)?;

        for layer in &manifest.layers {
            let data = self.store.get(layer).map_err(|e| EngineError::build(index, e))?;
            let diff = LayerDiff::decode(&data).map_err(|e| EngineError::build(index, e))?;
            state.snapshot.apply(&diff);
        }

        state.layers = manifest.layers;
        state.config = manifest.config;
        state.history = manifest.history;
        state.parent_key = digest.to_string();
        Ok(())
    }

    fn step_key(&self, state: &BuildState, content: &StepKey<'_>) -> Result<Digest> {
        let canonical = serde_json::to_vec(content)?;
        Ok(Digest::of_parts([
            state.parent_key.as_bytes(),
            b"\n".as_slice(),
            canonical.as_slice(),
        ]))
    }

    /// Reuse a cached step. Returns false on a miss.
    fn replay(&self, state: &mut BuildState, key: &Digest, instruction: &BuildInstruction) -> Result<bool> {
        let cached = self.cache.lock().get(key).cloned();
        let layer = match cached {
            None => return Ok(false),
            Some(None) => None,
            Some(Some(layer)) => {
                state.lease.hold(&layer);
                // The layer may have been pruned since it was built
                let Ok(data) = self.store.get(&layer) else {
                    return Ok(false);
                };
                state.snapshot.apply(&LayerDiff::decode(&data)?);
                Some(layer)
            }
        };

        tracing::debug!(key = %key.short(), layer = ?layer.as_ref().map(|d| d.short().to_string()), "Cache hit");
        state.cache_hits += 1;
        self.record(state, key, layer, instruction);
        Ok(true)
    }

    /// Store the diff produced by an executed step.
    fn commit_step(
        &self,
        state: &mut BuildState,
        key: Digest,
        after: Snapshot,
        instruction: &BuildInstruction,
    ) -> Result<()> {
        let diff = state.snapshot.diff(&after);
        let layer = if diff.is_empty() {
            None
        } else {
            let data = diff.encode()?;
            state.lease.hold(&Digest::of(&data));
            Some(self.store.put(&data)?)
        };

        state.cache_misses += 1;
        state.snapshot = after;
        self.cache.lock().insert(key.clone(), layer.clone());
        self.record(state, &key, layer, instruction);
        Ok(())
    }

    fn record(
        &self,
        state: &mut BuildState,
        key: &Digest,
        layer: Option<Digest>,
        instruction: &BuildInstruction,
    ) {
        state.history.push(HistoryEntry {
            created_by: instruction.describe(),
            empty_layer: layer.is_none(),
        });
        if let Some(layer) = layer {
            state.layers.push(layer);
        }
        state.parent_key = key.to_string();
    }
}

/// Resolve a COPY source inside the build context, refusing escapes.
fn resolve_source(context: &Path, src: &str) -> Result<PathBuf> {
    let relative = normalize_path("/", src)?;
    let path = context.join(&relative);
    if std::fs::symlink_metadata(&path).is_err() {
        return Err(EngineError::not_found(
            "copy source",
            format!("{} (in context {})", src, context.display()),
        ));
    }
    Ok(path)
}

/// Make `path` absolute against `workdir`, keeping a trailing slash.
fn absolute_in(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::ShellRunner;
    use crate::snapshot::Entry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Runner that records invocations and writes `<command>.out`.
    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for CountingRunner {
        async fn run(&self, snapshot: &Snapshot, request: &RunRequest) -> Result<Snapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.command == "fail" {
                return Err(EngineError::RuntimeError("exit code 1".to_string()));
            }
            let mut after = snapshot.clone();
            if request.command != "noop" {
                let dir = normalize_path("/", &request.workdir)?;
                let name = format!("{}.out", request.command.replace(' ', "_"));
                let path = if dir.is_empty() { name } else { format!("{}/{}", dir, name) };
                after.insert(&path, Entry::file(request.command.as_bytes()));
            }
            Ok(after)
        }
    }

    fn builder() -> (ImageBuilder, Arc<LayerStore>, Arc<CountingRunner>) {
        let store = Arc::new(LayerStore::in_memory());
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
        });
        (ImageBuilder::new(store.clone(), runner.clone()), store, runner)
    }

    fn context() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        dir
    }

    fn copy(src: &str, dst: &str) -> BuildInstruction {
        BuildInstruction::CopyFiles {
            src: src.to_string(),
            dst: dst.to_string(),
        }
    }

    fn run(command: &str) -> BuildInstruction {
        BuildInstruction::RunCommand {
            command: command.to_string(),
        }
    }

    #[tokio::test]
    async fn test_rebuild_hits_cache() {
        let (builder, _store, runner) = builder();
        let ctx = context();
        let steps = vec![copy("a.txt", "/b"), run("echo hi")];

        let first = builder.build(&steps, ctx.path(), None).await.unwrap();
        assert_eq!(first.layers.len(), 2);
        assert_eq!(first.cache_misses, 2);
        assert_eq!(first.cache_hits, 0);

        let second = builder.build(&steps, ctx.path(), None).await.unwrap();
        assert_eq!(second.layers, first.layers);
        assert_eq!(second.digest, first.digest);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(second.cache_misses, 0);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changed_source_invalidates_downstream() {
        let (builder, _store, runner) = builder();
        let ctx = context();
        let steps = vec![copy("a.txt", "/b"), run("echo hi")];

        let first = builder.build(&steps, ctx.path(), None).await.unwrap();
        std::fs::write(ctx.path().join("a.txt"), "changed").unwrap();
        let second = builder.build(&steps, ctx.path(), None).await.unwrap();

        assert_ne!(first.layers[0], second.layers[0]);
        assert_eq!(second.cache_misses, 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_env_change_invalidates_run() {
        let (builder, _store, _runner) = builder();
        let ctx = context();
        let env = |v: &str| BuildInstruction::SetEnv {
            key: "MODE".to_string(),
            value: v.to_string(),
        };

        builder
            .build(&[env("a"), run("echo hi")], ctx.path(), None)
            .await
            .unwrap();
        let second = builder
            .build(&[env("b"), run("echo hi")], ctx.path(), None)
            .await
            .unwrap();
        assert_eq!(second.cache_hits, 0);
    }

    #[tokio::test]
    async fn test_noop_run_adds_no_layer() {
        let (builder, store, _runner) = builder();
        let ctx = context();
        let result = builder
            .build(&[copy("a.txt", "/a.txt"), run("noop")], ctx.path(), None)
            .await
            .unwrap();
        assert_eq!(result.layers.len(), 1);

        let manifest = store.manifest(&result.digest).unwrap();
        assert_eq!(manifest.history.len(), 2);
        assert!(manifest.history[1].empty_layer);
    }

    #[tokio::test]
    async fn test_metadata_instructions() {
        let (builder, store, _runner) = builder();
        let ctx = context();
        let steps = vec![
            BuildInstruction::SetWorkdir {
                path: "/srv".to_string(),
            },
            BuildInstruction::SetWorkdir {
                path: "app".to_string(),
            },
            BuildInstruction::SetEntrypoint {
                command: vec!["/bin/server".to_string()],
            },
            BuildInstruction::ExposePort { port: 8080 },
            BuildInstruction::SetLabel {
                key: "team".to_string(),
                value: "infra".to_string(),
            },
            copy("a.txt", "data/"),
        ];
        let result = builder.build(&steps, ctx.path(), None).await.unwrap();
        let manifest = store.manifest(&result.digest).unwrap();

        assert_eq!(manifest.config.working_dir.as_deref(), Some("/srv/app"));
        assert_eq!(manifest.config.command(), vec!["/bin/server"]);
        assert!(manifest.config.exposed_ports.contains(&8080));
        assert_eq!(manifest.config.labels["team"], "infra");

        let layer = LayerDiff::decode(&store.get(&result.layers[0]).unwrap()).unwrap();
        assert!(layer.puts.contains_key("srv/app/data/a.txt"));
    }

    #[tokio::test]
    async fn test_failure_carries_index_and_tags_nothing() {
        let (builder, store, _runner) = builder();
        let ctx = context();
        let steps = vec![copy("a.txt", "/a"), run("fail")];

        let err = builder.build(&steps, ctx.path(), Some("app")).await.unwrap_err();
        match err {
            EngineError::BuildError { index, cause } => {
                assert_eq!(index, 1);
                assert!(cause.contains("exit code 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.resolve_tag("app").is_err());
    }

    #[tokio::test]
    async fn test_missing_copy_source() {
        let (builder, _store, _runner) = builder();
        let ctx = context();
        let err = builder
            .build(&[copy("nope.txt", "/x")], ctx.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildError { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_set_base_must_be_first() {
        let (builder, _store, _runner) = builder();
        let ctx = context();
        let steps = vec![
            run("echo hi"),
            BuildInstruction::SetBase {
                image: SCRATCH.to_string(),
            },
        ];
        let err = builder.build(&steps, ctx.path(), None).await.unwrap_err();
        assert!(matches!(err, EngineError::BuildError { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_unknown_base_image() {
        let (builder, _store, _runner) = builder();
        let ctx = context();
        let steps = vec![BuildInstruction::SetBase {
            image: "missing:1".to_string(),
        }];
        let err = builder.build(&steps, ctx.path(), None).await.unwrap_err();
        match err {
            EngineError::BuildError { index, cause } => {
                assert_eq!(index, 0);
                assert!(cause.contains("missing:1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_child_image_inherits_base() {
        let (builder, store, _runner) = builder();
        let ctx = context();
        let base = builder
            .build(
                &[
                    copy("a.txt", "/etc/a.txt"),
                    BuildInstruction::SetEnv {
                        key: "BASE".to_string(),
                        value: "1".to_string(),
                    },
                ],
                ctx.path(),
                Some("base:1"),
            )
            .await
            .unwrap();

        let child = builder
            .build(
                &[
                    BuildInstruction::SetBase {
                        image: "base:1".to_string(),
                    },
                    run("echo child"),
                ],
                ctx.path(),
                Some("child"),
            )
            .await
            .unwrap();

        assert_eq!(child.layers[0], base.layers[0]);
        assert_eq!(child.layers.len(), 2);
        let manifest = store.manifest(&child.digest).unwrap();
        assert_eq!(manifest.config.env["BASE"], "1");
        assert_eq!(manifest.history.len(), 4);
    }

    #[tokio::test]
    async fn test_finished_build_leaves_only_manifest_holds() {
        let (builder, store, _) = builder();
        let ctx = context();
        let result = builder
            .build(&[copy("a.txt", "/a.txt"), run("echo hi")], ctx.path(), None)
            .await
            .unwrap();

        assert_eq!(store.ref_count(&result.digest), 0);
        for layer in &result.layers {
            assert_eq!(store.ref_count(layer), 1);
        }
    }

    #[tokio::test]
    async fn test_pruned_layer_is_rebuilt() {
        let (builder, store, runner) = builder();
        let ctx = context();
        let steps = vec![run("echo hi")];

        builder.build(&steps, ctx.path(), None).await.unwrap();
        store.prune().unwrap();
        let again = builder.build(&steps, ctx.path(), None).await.unwrap();

        assert_eq!(again.cache_misses, 1);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shell_runner_build_is_deterministic() {
        let store = Arc::new(LayerStore::in_memory());
        let ctx = context();
        let steps = vec![copy("a.txt", "/b"), run("echo hi > hi.txt")];

        let first = ImageBuilder::new(store.clone(), Arc::new(ShellRunner::new()))
            .build(&steps, ctx.path(), None)
            .await
            .unwrap();
        // A fresh builder has no cache and must execute again
        let second = ImageBuilder::new(store, Arc::new(ShellRunner::new()))
            .build(&steps, ctx.path(), None)
            .await
            .unwrap();
        assert_eq!(first.layers, second.layers);
        assert_eq!(second.cache_misses, 2);
    }
}
