//! Persisted delivery obligations.
//!
//! A [`QueueItem`] is one (message, recipient) pair waiting to be delivered.
//! Every state change goes through a [`QueueStore`] as a conditional update:
//! [`QueueStore::claim`] is a compare-and-set on the status and
//! [`QueueStore::update`] a compare-and-set on the record version, so two
//! managers sharing a store can never both work on one item.

pub mod backends;
mod config;
mod error;
mod item;
mod store;

pub use backends::{FileQueueStore, FileQueueStoreBuilder, MemoryQueueStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError};
pub use item::{QueueItem, QueueItemId, QueueStatus};
pub use store::QueueStore;
