mod file;
mod memory;

pub use file::{FileQueueStore, FileQueueStoreBuilder};
pub use memory::MemoryQueueStore;
