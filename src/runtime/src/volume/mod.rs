//! Volume management for persistent named volumes.
//!
//! Provides `VolumeManager`, which owns volume data directories and
//! tracks which containers mount each volume.

mod store;

pub use store::VolumeManager;
