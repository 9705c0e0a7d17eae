use std::time::SystemTime;

use async_trait::async_trait;

use crate::{QueueItem, QueueItemId, QueueStatus, Result};

/// Persistence for queue items.
///
/// Mutations are conditional on what is currently stored, checked inside the
/// store rather than by the caller, so they stay correct when several
/// managers share one store.
#[async_trait]
pub trait QueueStore: Send + Sync + std::fmt::Debug {
    /// Persist a new item. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, item: &QueueItem) -> Result<()>;

    async fn get(&self, id: &QueueItemId) -> Result<Option<QueueItem>>;

    /// All items, optionally restricted to one status, oldest first.
    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>>;

    /// Up to `limit` items that are pending, or retrying and due at `now`,
    /// in dispatch order.
    async fn fetch_ready(&self, now: SystemTime, limit: usize) -> Result<Vec<QueueItem>>;

    /// Move the item to `Processing` if and only if it is currently pending
    /// or due for retry. Returns the claimed record, or `None` when another
    /// claimer won or the item is not claimable.
    async fn claim(&self, id: &QueueItemId, now: SystemTime) -> Result<Option<QueueItem>>;

    /// Replace the stored record with `item` if the stored version still
    /// equals `item.version`. Returns the written record (version bumped), or
    /// `None` if the record changed underneath the caller.
    async fn update(&self, item: &QueueItem) -> Result<Option<QueueItem>>;

    /// Returns whether anything was deleted.
    async fn delete(&self, id: &QueueItemId) -> Result<bool>;

    /// Delete completed items last updated before `completed_before` and
    /// failed or dead-lettered items last updated before `failed_before`.
    async fn purge(&self, completed_before: SystemTime, failed_before: SystemTime)
    -> Result<usize>;

    /// Reset `Processing` items whose last attempt started before
    /// `started_before` back to `Pending`, leaving the ids in `skip` alone.
    /// Returns the reset records.
    async fn reset_stale(
        &self,
        started_before: SystemTime,
        now: SystemTime,
        skip: &[QueueItemId],
    ) -> Result<Vec<QueueItem>>;
}

/// Whether `purge` should remove `item`.
pub(crate) fn is_purgeable(
    item: &QueueItem,
    completed_before: SystemTime,
    failed_before: SystemTime,
) -> bool {
    match item.status {
        QueueStatus::Completed => item.updated_at < completed_before,
        QueueStatus::Failed | QueueStatus::DeadLetter => item.updated_at < failed_before,
        _ => false,
    }
}

/// Whether `reset_stale` should reset `item`.
pub(crate) fn is_stale(
    item: &QueueItem,
    started_before: SystemTime,
    skip: &[QueueItemId],
) -> bool {
    item.status == QueueStatus::Processing
        && item.last_attempt_at.is_none_or(|at| at < started_before)
        && !skip.contains(&item.id)
}

pub(crate) fn mark_recovered(item: &mut QueueItem, now: SystemTime) {
    item.status = QueueStatus::Pending;
    item.next_attempt_at = None;
    item.updated_at = now;
    item.version += 1;
}
