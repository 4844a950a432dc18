//! Named volume model.
//!
//! A volume is a host directory with a lifecycle independent of any
//! container. Containers bind volumes at create time and hold them
//! until they are removed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Metadata for a named volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name (unique identifier).
    pub name: String,

    /// Volume driver (only "local" is supported).
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Host directory holding the volume's data.
    pub mount_point: PathBuf,

    /// User-defined labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Containers currently mounting this volume.
    #[serde(default)]
    pub in_use_by: BTreeSet<String>,

    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

fn default_driver() -> String {
    "local".to_string()
}

impl Volume {
    pub fn new(name: &str, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            driver: default_driver(),
            mount_point: mount_point.into(),
            labels: BTreeMap::new(),
            in_use_by: BTreeSet::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Record a container mount. Idempotent.
    pub fn attach(&mut self, container_id: &str) {
        self.in_use_by.insert(container_id.to_string());
    }

    /// Drop a container mount. Idempotent.
    pub fn detach(&mut self, container_id: &str) {
        self.in_use_by.remove(container_id);
    }

    pub fn is_in_use(&self) -> bool {
        !self.in_use_by.is_empty()
    }
}

/// Validate a user-supplied volume or network name.
///
/// Names become directory names, so path separators and dot-only names
/// are rejected.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
