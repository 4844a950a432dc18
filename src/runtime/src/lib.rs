//! Dockyard Runtime - container engine implementation.
//!
//! This crate provides the engine behind Dockyard: the content-addressed
//! layer store, the image builder and its cache, container lifecycle and
//! process supervision, volumes, networks with name resolution, and the
//! [`Engine`] facade tying them together.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod bundle;
pub mod container;
pub mod engine;
pub mod log;
pub mod network;
pub mod persist;
pub mod snapshot;
pub mod store;
pub mod volume;

// Re-export common types
pub use build::{BuildResult, CommandRunner, Dockerfile, ImageBuilder, RunRequest, ShellRunner};
pub use bundle::ImageBundle;
pub use container::{ContainerManager, LogStream};
pub use engine::{Engine, ImageRemoval};
pub use network::NetworkManager;
pub use snapshot::{Change, ChangeKind, Entry, LayerDiff, Snapshot};
pub use store::{BlobBackend, DiskBackend, LayerStore, Lease, MemoryBackend, PruneReport};
pub use volume::VolumeManager;

/// Dockyard Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
