pub mod blob;
pub mod checkpoint;
pub mod event_log;
pub mod index;

pub use blob::{BlobHash, BlobStore, FilesystemBlobStore, InMemoryBlobStore};
pub use checkpoint::CheckpointStore;
pub use event_log::{InMemoryEventLog, RedbEventLog};
pub use index::{CheckpointRef, InMemoryIndexStore, IndexStore, RedbIndexStore};
