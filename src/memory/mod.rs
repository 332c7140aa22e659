pub mod cache;
pub mod prompt;
pub mod store;
pub mod vcs;

pub use cache::SnapshotCache;
pub use store::{MemoryEntry, MemoryItem, MemoryStore, DEFAULT_SEPARATOR, MAX_VALUE_BYTES};
pub use vcs::VcsContext;
