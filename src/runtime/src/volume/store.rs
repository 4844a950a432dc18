//! Named volume registry.
//!
//! Volume data lives under `<home>/volumes/<name>/`. With persistence
//! enabled the registry is mirrored to `volumes.json` with atomic writes
//! after every mutation.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use dockyard_core::error::{EngineError, Result};
use dockyard_core::volume::is_valid_name;
use dockyard_core::{EngineConfig, Volume};
use parking_lot::RwLock;

use crate::persist::JsonFile;

/// Serializable wrapper for the volumes file.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct VolumesFile {
    volumes: HashMap<String, Volume>,
}

/// Creates, tracks and removes named volumes.
#[derive(Debug)]
pub struct VolumeManager {
    volumes_dir: PathBuf,
    volumes: RwLock<BTreeMap<String, Volume>>,
    file: Option<JsonFile<VolumesFile>>,
}

impl VolumeManager {
    /// An empty registry keeping volume data under `volumes_dir`.
    pub fn new(volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            volumes_dir: volumes_dir.into(),
            volumes: RwLock::new(BTreeMap::new()),
            file: None,
        }
    }

    /// Open the registry described by `config`, loading `volumes.json`
    /// when persistence is enabled.
    ///
    /// Mount records are dropped on load: containers do not outlive the
    /// engine.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let mut manager = Self::new(config.volumes_dir());
        if config.persist {
            let file = JsonFile::new(config.volumes_file());
            let loaded: VolumesFile = file.load()?;
            tracing::debug!(count = loaded.volumes.len(), "Loaded volumes");
            *manager.volumes.get_mut() = loaded
                .volumes
                .into_iter()
                .map(|(name, mut volume)| {
                    volume.in_use_by.clear();
                    (name, volume)
                })
                .collect();
            manager.file = Some(file);
        }
        Ok(manager)
    }

    /// Create a volume and its data directory.
    pub fn create(&self, name: &str, labels: BTreeMap<String, String>) -> Result<Volume> {
        if !is_valid_name(name) {
            return Err(EngineError::ConfigError(format!(
                "invalid volume name '{}'",
                name
            )));
        }

        let volume = {
            let mut volumes = self.volumes.write();
            if volumes.contains_key(name) {
                return Err(EngineError::already_exists("volume", name));
            }

            let dir = self.volume_dir(name);
            std::fs::create_dir_all(&dir).map_err(|e| {
                EngineError::Other(format!(
                    "failed to create volume directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;

            let mut volume = Volume::new(name, dir);
            volume.labels = labels;
            volumes.insert(name.to_string(), volume.clone());
            volume
        };

        tracing::info!(volume = name, "Created volume");
        self.save()?;
        Ok(volume)
    }

    /// Remove a volume and its data. Fails with `InUse` while mounted.
    pub fn remove(&self, name: &str) -> Result<Volume> {
        let volume = {
            let mut volumes = self.volumes.write();
            let volume = volumes
                .get(name)
                .ok_or_else(|| EngineError::not_found("volume", name))?;
            if volume.is_in_use() {
                return Err(EngineError::InUse {
                    kind: "volume",
                    name: name.to_string(),
                    users: volume.in_use_by.len(),
                });
            }
            volumes
                .remove(name)
                .ok_or_else(|| EngineError::not_found("volume", name))?
        };

        if volume.mount_point.exists() {
            if let Err(e) = std::fs::remove_dir_all(&volume.mount_point) {
                tracing::warn!(volume = name, error = %e, "Failed to remove volume data");
            }
        }

        tracing::info!(volume = name, "Removed volume");
        self.save()?;
        Ok(volume)
    }

    pub fn get(&self, name: &str) -> Result<Volume> {
        self.volumes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("volume", name))
    }

    /// All volumes, sorted by name.
    pub fn list(&self) -> Vec<Volume> {
        self.volumes.read().values().cloned().collect()
    }

    /// Remove every volume no container mounts. Returns the removed names.
    pub fn prune(&self) -> Result<Vec<String>> {
        let unused: Vec<String> = self
            .volumes
            .read()
            .values()
            .filter(|v| !v.is_in_use())
            .map(|v| v.name.clone())
            .collect();

        let mut pruned = Vec::with_capacity(unused.len());
        for name in unused {
            // A container may have mounted it since the scan
            match self.remove(&name) {
                Ok(_) => pruned.push(name),
                Err(EngineError::InUse { .. }) | Err(EngineError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(pruned)
    }

    /// Record that `container_id` mounts `name`.
    pub fn attach(&self, name: &str, container_id: &str) -> Result<Volume> {
        let volume = {
            let mut volumes = self.volumes.write();
            let volume = volumes
                .get_mut(name)
                .ok_or_else(|| EngineError::not_found("volume", name))?;
            volume.attach(container_id);
            volume.clone()
        };
        tracing::debug!(volume = name, container_id, "Attached volume");
        self.save()?;
        Ok(volume)
    }

    /// Drop `container_id`'s mount of `name`. Missing volumes are ignored.
    pub fn detach(&self, name: &str, container_id: &str) -> Result<()> {
        let changed = match self.volumes.write().get_mut(name) {
            Some(volume) => {
                volume.detach(container_id);
                true
            }
            None => false,
        };
        if changed {
            tracing::debug!(volume = name, container_id, "Detached volume");
            self.save()?;
        }
        Ok(())
    }

    /// Data directory for a named volume.
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.volumes_dir.join(name)
    }

    /// Registry file, when persistence is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    fn save(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let snapshot = VolumesFile {
            volumes: self
                .volumes
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        file.save(&snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_core::error::ErrorKind;
    use tempfile::TempDir;

    fn manager() -> (TempDir, VolumeManager) {
        let dir = TempDir::new().unwrap();
        let manager = VolumeManager::new(dir.path().join("volumes"));
        (dir, manager)
    }

    fn persistent(home: &Path) -> VolumeManager {
        let mut config = EngineConfig::with_home(home);
        config.persist = true;
        VolumeManager::open(&config).unwrap()
    }

    #[test]
    fn test_create_makes_directory() {
        let (_dir, manager) = manager();
        let volume = manager.create("mydata", BTreeMap::new()).unwrap();
        assert!(volume.mount_point.ends_with("mydata"));
        assert!(volume.mount_point.is_dir());
        assert_eq!(volume.driver, "local");
    }

    #[test]
    fn test_create_duplicate() {
        let (_dir, manager) = manager();
        manager.create("mydata", BTreeMap::new()).unwrap();
        let err = manager.create("mydata", BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_invalid_names() {
        let (_dir, manager) = manager();
        assert!(manager.create("../escape", BTreeMap::new()).is_err());
        assert!(manager.create("", BTreeMap::new()).is_err());
        assert!(manager.create("..", BTreeMap::new()).is_err());
    }

    #[test]
    fn test_remove_deletes_data() {
        let (_dir, manager) = manager();
        let volume = manager.create("mydata", BTreeMap::new()).unwrap();
        std::fs::write(volume.mount_point.join("f"), "x").unwrap();

        manager.remove("mydata").unwrap();
        assert!(!volume.mount_point.exists());
        assert_eq!(manager.get("mydata").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_unknown() {
        let (_dir, manager) = manager();
        assert_eq!(manager.remove("nope").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_in_use_fails() {
        let (_dir, manager) = manager();
        manager.create("mydata", BTreeMap::new()).unwrap();
        manager.attach("mydata", "abc123").unwrap();

        match manager.remove("mydata").unwrap_err() {
            EngineError::InUse { kind, name, users } => {
                assert_eq!(kind, "volume");
                assert_eq!(name, "mydata");
                assert_eq!(users, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        manager.detach("mydata", "abc123").unwrap();
        manager.remove("mydata").unwrap();
    }

    #[test]
    fn test_detach_missing_volume_is_ignored() {
        let (_dir, manager) = manager();
        manager.detach("ghost", "abc123").unwrap();
    }

    #[test]
    fn test_list_sorted() {
        let (_dir, manager) = manager();
        manager.create("zeta", BTreeMap::new()).unwrap();
        manager.create("alpha", BTreeMap::new()).unwrap();
        let names: Vec<String> = manager.list().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_prune_keeps_mounted() {
        let (_dir, manager) = manager();
        manager.create("unused1", BTreeMap::new()).unwrap();
        manager.create("unused2", BTreeMap::new()).unwrap();
        manager.create("in_use", BTreeMap::new()).unwrap();
        manager.attach("in_use", "abc123").unwrap();

        let pruned = manager.prune().unwrap();
        assert_eq!(pruned, vec!["unused1", "unused2"]);

        let remaining = manager.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "in_use");
    }

    #[test]
    fn test_persisted_across_reopen() {
        let home = TempDir::new().unwrap();
        {
            let manager = persistent(home.path());
            let mut labels = BTreeMap::new();
            labels.insert("env".to_string(), "test".to_string());
            manager.create("mydata", labels).unwrap();
            manager.attach("mydata", "abc123").unwrap();
        }

        let reopened = persistent(home.path());
        let volume = reopened.get("mydata").unwrap();
        assert_eq!(volume.labels["env"], "test");
        assert!(volume.in_use_by.is_empty());
        reopened.remove("mydata").unwrap();

        let path = reopened.path().unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_in_memory_writes_no_file() {
        let home = TempDir::new().unwrap();
        let manager = VolumeManager::open(&EngineConfig::with_home(home.path())).unwrap();
        manager.create("mydata", BTreeMap::new()).unwrap();
        assert!(manager.path().is_none());
        assert!(!home.path().join("volumes.json").exists());
    }
}
