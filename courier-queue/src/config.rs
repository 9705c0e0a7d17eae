use std::sync::Arc;

use serde::Deserialize;

use crate::{FileQueueStore, MemoryQueueStore, QueueStore, Result};

/// Selects the queue store backend.
///
/// File-backed queue in RON config:
/// ```ron
/// store: (
///     type: "File",
///     path: "/var/spool/courier/queue",
/// )
/// ```
///
/// Memory-backed queue, lost on restart:
/// ```ron
/// store: (type: "Memory")
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    File(FileQueueStore),
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File(FileQueueStore::default())
    }
}

impl StoreConfig {
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory => None,
        }
    }

    /// Initialise the selected backend and return it as a trait object.
    ///
    /// # Errors
    /// Fails when a file store directory cannot be created or cleaned.
    pub fn into_store(self) -> Result<Arc<dyn QueueStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory => Ok(Arc::new(MemoryQueueStore::new())),
        }
    }
}
