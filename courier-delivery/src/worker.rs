//! Bounded-concurrency execution of delivery jobs.
//!
//! A [`Worker`] turns a claimed job into one [`DeliveryResult`] per queue
//! item and never fails: every error, including the outer wall-clock
//! timeout, comes back as a result. The [`WorkerPool`] caps how many jobs
//! run at once and keeps track of the items they hold so an interrupted
//! shutdown can hand them back.

use std::{future::Future, sync::Arc, time::Duration};

use courier_dkim::DkimSigner;
use courier_queue::{QueueItem, QueueItemId};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tracing::{debug, warn};

use crate::{DeliveryError, DeliveryResult, MessageStore, Transport};

/// Everything a worker needs to deliver one job.
#[derive(Clone)]
pub struct Worker {
    transport: Arc<dyn Transport>,
    messages: Arc<dyn MessageStore>,
    /// Present when messages are signed on every attempt.
    signer: Option<Arc<DkimSigner>>,
    item_timeout: Duration,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("signs", &self.signer.is_some())
            .field("item_timeout", &self.item_timeout)
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        messages: Arc<dyn MessageStore>,
        signer: Option<Arc<DkimSigner>>,
        item_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            messages,
            signer,
            item_timeout,
        }
    }

    /// Deliver `items`, which all belong to one message, and return their
    /// results in the same order.
    #[tracing::instrument(skip_all, fields(message_id = items.first().map(|i| i.message_id.as_str()), items = items.len()))]
    pub async fn process(&self, items: &[QueueItem]) -> Vec<DeliveryResult> {
        let Some(first) = items.first() else {
            return Vec::new();
        };

        match tokio::time::timeout(self.item_timeout, self.attempt(&first.message_id, items)).await
        {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    message_id = %first.message_id,
                    timeout = ?self.item_timeout,
                    "Delivery attempt exceeded its time limit"
                );
                let err = DeliveryError::Timeout(format!(
                    "delivery attempt exceeded {}s",
                    self.item_timeout.as_secs()
                ));
                fail_all(items, &err)
            }
        }
    }

    async fn attempt(&self, message_id: &str, items: &[QueueItem]) -> Vec<DeliveryResult> {
        let message = match self.messages.get_message(message_id).await {
            Ok(message) => message,
            Err(err) => return fail_all(items, &err.into()),
        };

        let raw = match &self.signer {
            Some(signer) => match signer.sign_message(&message.raw) {
                Ok(signed) => signed,
                Err(err) => return fail_all(items, &err.into()),
            },
            None => message.raw,
        };

        if let [item] = items {
            return vec![
                self.transport
                    .deliver(&raw, &message.from, &item.recipient)
                    .await,
            ];
        }

        let recipients: Vec<String> = items.iter().map(|i| i.recipient.clone()).collect();
        let mut results = self
            .transport
            .deliver_batch(&raw, &message.from, &recipients)
            .await
            .into_iter();

        items
            .iter()
            .map(|item| {
                results.next().unwrap_or_else(|| {
                    DeliveryResult::failed(
                        &item.recipient,
                        &DeliveryError::Internal("transport returned no result".into()),
                        None,
                    )
                })
            })
            .collect()
    }
}

fn fail_all(items: &[QueueItem], err: &DeliveryError) -> Vec<DeliveryResult> {
    items
        .iter()
        .map(|item| DeliveryResult::failed(&item.recipient, err, None))
        .collect()
}

/// Runs at most `size` jobs at a time.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: u32,
    tasks: Mutex<JoinSet<()>>,
    in_flight: Arc<DashMap<QueueItemId, QueueItem>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = u32::try_from(size.max(1)).unwrap_or(u32::MAX >> 3);
        Self {
            permits: Arc::new(Semaphore::new(size as usize)),
            size,
            tasks: Mutex::new(JoinSet::new()),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Jobs currently running.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.size as usize - self.permits.available_permits()
    }

    /// Ids of the items held by running jobs.
    #[must_use]
    pub fn in_flight_ids(&self) -> Vec<QueueItemId> {
        self.in_flight.iter().map(|e| e.key().clone()).collect()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    /// Run `job` in the slot held by `permit`. `items` are tracked as in
    /// flight until the job finishes.
    pub fn spawn<F>(&self, permit: OwnedSemaphorePermit, items: &[QueueItem], job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ids: Vec<QueueItemId> = items.iter().map(|item| item.id.clone()).collect();
        for item in items {
            self.in_flight.insert(item.id.clone(), item.clone());
        }

        let in_flight = Arc::clone(&self.in_flight);
        let mut tasks = self.tasks.lock();
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            job.await;
            for id in &ids {
                in_flight.remove(id);
            }
            drop(permit);
        });
    }

    /// Wait until no job is running.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self.permits.acquire_many(self.size).await {
            drop(all);
        }
    }

    /// Wait up to `timeout` for running jobs, then cancel the rest. Returns
    /// the items held by cancelled jobs, as they were when claimed.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<QueueItem> {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_ok() {
            debug!("Worker pool drained");
            return Vec::new();
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        warn!(
            running = self.busy(),
            "Shutdown timeout exceeded, cancelling in-flight deliveries"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        self.in_flight_ids()
            .into_iter()
            .filter_map(|id| self.in_flight.remove(&id).map(|(_, item)| item))
            .collect()
    }
}
