use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};

use crate::{
    QueueItem, QueueItemId, QueueStatus, QueueStore, Result, StoreError,
    store::{is_purgeable, is_stale, mark_recovered},
};

/// In-memory queue store.
///
/// Every conditional mutation runs while holding the shard lock of the
/// entry it touches, which makes claim and update atomic. Cloning shares
/// the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueueStore {
    items: Arc<DashMap<QueueItemId, QueueItem>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn insert(&self, item: &QueueItem) -> Result<()> {
        match self.items.entry(item.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(item.id.clone())),
            Entry::Vacant(entry) => {
                entry.insert(item.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &QueueItemId) -> Result<Option<QueueItem>> {
        Ok(self.items.get(id).map(|item| item.clone()))
    }

    async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>> {
        let mut items: Vec<QueueItem> = self
            .items
            .iter()
            .filter(|item| status.is_none_or(|s| item.status == s))
            .map(|item| item.clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn fetch_ready(&self, now: SystemTime, limit: usize) -> Result<Vec<QueueItem>> {
        let mut ready: Vec<QueueItem> = self
            .items
            .iter()
            .filter(|item| item.is_ready(now))
            .map(|item| item.clone())
            .collect();
        ready.sort_by(QueueItem::dispatch_order);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn claim(&self, id: &QueueItemId, now: SystemTime) -> Result<Option<QueueItem>> {
        let Some(mut item) = self.items.get_mut(id) else {
            return Ok(None);
        };

        if !item.is_ready(now) {
            return Ok(None);
        }

        item.mark_claimed(now);
        Ok(Some(item.clone()))
    }

    async fn update(&self, item: &QueueItem) -> Result<Option<QueueItem>> {
        let Some(mut stored) = self.items.get_mut(&item.id) else {
            return Err(StoreError::NotFound(item.id.clone()));
        };

        if stored.version != item.version {
            return Ok(None);
        }

        let mut next = item.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(Some(next))
    }

    async fn delete(&self, id: &QueueItemId) -> Result<bool> {
        Ok(self.items.remove(id).is_some())
    }

    async fn purge(
        &self,
        completed_before: SystemTime,
        failed_before: SystemTime,
    ) -> Result<usize> {
        let before = self.items.len();
        self.items
            .retain(|_, item| !is_purgeable(item, completed_before, failed_before));
        Ok(before.saturating_sub(self.items.len()))
    }

    async fn reset_stale(
        &self,
        started_before: SystemTime,
        now: SystemTime,
        skip: &[QueueItemId],
    ) -> Result<Vec<QueueItem>> {
        let mut reset = Vec::new();
        for mut item in self.items.iter_mut() {
            if is_stale(&item, started_before, skip) {
                mark_recovered(&mut item, now);
                reset.push(item.clone());
            }
        }
        Ok(reset)
    }
}
