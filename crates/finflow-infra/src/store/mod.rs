//! Persistence backends for blobs, runs, artifacts, and the fingerprint index.

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::{MemoryBlobStore, MemoryFingerprintStore, MemoryRunStore};
