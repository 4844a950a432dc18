//! Image model: build instructions, image config and manifests.
//!
//! A manifest is serialized canonically (sorted maps, no timestamps) so
//! that identical builds produce identical manifest digests.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::Result;

/// Reference naming the empty base image.
pub const SCRATCH: &str = "scratch";

/// Manifest schema version written by this engine.
pub const SCHEMA_VERSION: u32 = 2;

/// A single build instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildInstruction {
    /// Start from an existing image (`scratch` for none).
    SetBase { image: String },
    /// Copy a file or directory from the build context.
    CopyFiles { src: String, dst: String },
    /// Run a shell command against the accumulated filesystem.
    RunCommand { command: String },
    /// Set the entry command.
    SetEntrypoint { command: Vec<String> },
    /// Set the default arguments appended to the entry command.
    SetCmd { command: Vec<String> },
    /// Declare an exposed port.
    ExposePort { port: u16 },
    /// Set an environment variable.
    SetEnv { key: String, value: String },
    /// Set the working directory.
    SetWorkdir { path: String },
    /// Attach a label.
    SetLabel { key: String, value: String },
}

impl BuildInstruction {
    /// Whether executing this instruction can change the filesystem.
    pub fn mutates_filesystem(&self) -> bool {
        matches!(self, Self::CopyFiles { .. } | Self::RunCommand { .. })
    }

    /// Human-readable form used in image history.
    pub fn describe(&self) -> String {
        match self {
            Self::SetBase { image } => format!("FROM {}", image),
            Self::CopyFiles { src, dst } => format!("COPY {} {}", src, dst),
            Self::RunCommand { command } => format!("RUN {}", command),
            Self::SetEntrypoint { command } => format!("ENTRYPOINT {:?}", command),
            Self::SetCmd { command } => format!("CMD {:?}", command),
            Self::ExposePort { port } => format!("EXPOSE {}", port),
            Self::SetEnv { key, value } => format!("ENV {}={}", key, value),
            Self::SetWorkdir { path } => format!("WORKDIR {}", path),
            Self::SetLabel { key, value } => format!("LABEL {}={}", key, value),
        }
    }
}

/// Runtime metadata carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub exposed_ports: BTreeSet<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    /// The full argv a container runs: entrypoint followed by cmd.
    pub fn command(&self) -> Vec<String> {
        let mut argv = self.entrypoint.clone().unwrap_or_default();
        argv.extend(self.cmd.clone().unwrap_or_default());
        argv
    }

    /// Working directory, `/` when unset.
    pub fn workdir(&self) -> &str {
        self.working_dir.as_deref().unwrap_or("/")
    }
}

/// A single image history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

/// Serialized description of an image: ordered layers plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub schema_version: u32,
    pub layers: Vec<Digest>,
    pub config: ImageConfig,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl ImageManifest {
    pub fn new(layers: Vec<Digest>, config: ImageConfig, history: Vec<HistoryEntry>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            layers,
            config,
            history,
        }
    }

    /// An empty image with no layers.
    pub fn scratch() -> Self {
        Self::new(Vec::new(), ImageConfig::default(), Vec::new())
    }

    /// Canonical bytes; the manifest digest is computed over these.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of(&self.to_bytes()?))
    }
}

/// Summary row for image listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub digest: Digest,
    pub tags: Vec<String>,
    pub layer_count: usize,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ImageConfig {
        let mut config = ImageConfig {
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: Some(vec!["echo hi".to_string()]),
            working_dir: Some("/app".to_string()),
            ..Default::default()
        };
        config.env.insert("PATH".to_string(), "/bin".to_string());
        config.exposed_ports.insert(8080);
        config
    }

    #[test]
    fn test_command_joins_entrypoint_and_cmd() {
        assert_eq!(sample_config().command(), vec!["/bin/sh", "-c", "echo hi"]);
        assert!(ImageConfig::default().command().is_empty());
    }

    #[test]
    fn test_workdir_default() {
        assert_eq!(ImageConfig::default().workdir(), "/");
        assert_eq!(sample_config().workdir(), "/app");
    }

    #[test]
    fn test_manifest_digest_is_deterministic() {
        let layers = vec![Digest::of(b"layer-1"), Digest::of(b"layer-2")];
        let a = ImageManifest::new(layers.clone(), sample_config(), Vec::new());
        let b = ImageManifest::new(layers, sample_config(), Vec::new());
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
    }

    #[test]
    fn test_manifest_bytes_roundtrip() {
        let manifest = ImageManifest::new(
            vec![Digest::of(b"l")],
            sample_config(),
            vec![HistoryEntry {
                created_by: "RUN echo hi".to_string(),
                empty_layer: false,
            }],
        );
        let parsed = ImageManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_instruction_serialization_is_tagged() {
        let inst = BuildInstruction::ExposePort { port: 80 };
        let json = serde_json::to_string(&inst).unwrap();
        assert_eq!(json, r#"{"kind":"expose_port","port":80}"#);
    }

    #[test]
    fn test_mutates_filesystem() {
        assert!(BuildInstruction::RunCommand {
            command: "true".to_string()
        }
        .mutates_filesystem());
        assert!(!BuildInstruction::SetEnv {
            key: "A".to_string(),
            value: "b".to_string()
        }
        .mutates_filesystem());
    }

    #[test]
    fn test_describe() {
        let inst = BuildInstruction::CopyFiles {
            src: "a".to_string(),
            dst: "/b".to_string(),
        };
        assert_eq!(inst.describe(), "COPY a /b");
    }
}
