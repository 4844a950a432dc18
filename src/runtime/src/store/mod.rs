//! Content-addressed storage for layers and image manifests.

mod backend;
mod layer_store;

pub use backend::{BlobBackend, DiskBackend, MemoryBackend};
pub use layer_store::{normalize_tag, LayerStore, Lease, PruneReport};
