//! Dockyard Core - Foundational Types
//!
//! This crate provides the types shared by the Dockyard engine: errors,
//! configuration, content digests, the image and container models, the
//! volume and network models, log and event types.

pub mod config;
pub mod container;
pub mod digest;
pub mod error;
pub mod event;
pub mod image;
pub mod log;
pub mod network;
pub mod telemetry;
pub mod volume;

// Re-export commonly used types
pub use config::{EngineConfig, LogLevel};
pub use container::{
    ContainerConfig, ContainerId, ContainerInspect, ContainerState, ContainerSummary,
    EndpointInfo, MountInfo, VolumeMount,
};
pub use digest::Digest;
pub use error::{EngineError, ErrorKind, Result};
pub use event::{EngineEvent, EventEmitter, EventStream};
pub use image::{BuildInstruction, HistoryEntry, ImageConfig, ImageManifest, ImageSummary};
pub use log::{LogConfig, LogDriver, LogLine, LogStreamKind};
pub use network::{Network, NetworkEndpoint, Subnet};
pub use volume::Volume;

/// Dockyard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
