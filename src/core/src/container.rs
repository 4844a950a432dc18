//! Container model and lifecycle state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::log::LogConfig;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Writable layer allocated, process never started or not yet restarted
    Created,
    /// Entry process alive
    Running,
    /// Entry process frozen
    Paused,
    /// Entry process exited
    Stopped,
    /// Terminal; resources freed
    Removed,
}

impl ContainerState {
    /// Whether the FSM allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Stopped, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Created, Removed)
                | (Stopped, Removed)
        )
    }

    /// Whether an entry process exists for this state.
    pub fn has_process(self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Paused)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Container identifier: 12 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new random container ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binding of a named volume to a path inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(volume: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Parse a `name:/path[:ro]` binding.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.splitn(3, ':');
        let volume = parts.next().filter(|s| !s.is_empty())?;
        let target = parts.next().filter(|s| s.starts_with('/'))?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return None,
        };
        Some(Self {
            volume: volume.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

/// User-supplied configuration for `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Unique name; generated when absent
    #[serde(default)]
    pub name: Option<String>,
    /// Command override (replaces entrypoint + cmd)
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    /// Extra environment, layered over the image env
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory override
    #[serde(default)]
    pub workdir: Option<String>,
    /// Named volume bindings; fixed for the container's lifetime
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Networks joined at create time
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Log driver override; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

/// A container's membership in one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub network: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
}

/// Full metadata snapshot returned by `inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub image_digest: Digest,
    pub state: ContainerState,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub command: Vec<String>,
    pub config: ContainerConfig,
    pub mounts: Vec<MountInfo>,
    pub networks: Vec<EndpointInfo>,
    pub rootfs: PathBuf,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Resolved volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub volume: String,
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Row for container listings (ps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub command: Vec<String>,
    pub created_at: DateTime<Utc>,
}

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "brisk", "coastal", "drifting", "early", "foggy", "gentle", "hardy",
    "idle", "jolly", "lunar", "misty", "northern", "patient", "quiet", "rusty",
    "salty", "steady", "tidal", "upbeat", "windward", "young",
];

const NAME_NOUNS: &[&str] = &[
    "anchor", "barge", "berth", "buoy", "cargo", "crane", "dinghy", "ferry",
    "galley", "hull", "jetty", "keel", "mooring", "pier", "quay", "rudder",
    "schooner", "skiff", "tanker", "tugboat", "wharf",
];

/// A random `adjective_noun` container name.
pub fn generate_name() -> String {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    let adjective = NAME_ADJECTIVES.choose(&mut rng).copied().unwrap_or("idle");
    let noun = NAME_NOUNS.choose(&mut rng).copied().unwrap_or("barge");
    format!("{}_{}", adjective, noun)
}
