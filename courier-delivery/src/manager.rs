//! The delivery queue manager.
//!
//! A single poll loop fetches ready items, claims them, and hands them to
//! the [`WorkerPool`]. Workers only report [`DeliveryResult`]s; this module
//! alone turns results into state transitions:
//!
//! * delivered: `completed`
//! * permanent failure, or the last allowed attempt: `dead_letter`
//! * anything else: `retrying`, due after the backoff interval for the
//!   attempt just made
//!
//! Every transition is a conditional update in the [`QueueStore`], so a
//! record is never written from a stale copy.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use courier_common::{Signal, internal};
use courier_dkim::DkimSigner;
use courier_queue::{QueueItem, QueueItemId, QueueStatus, QueueStore};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    DeliveryResult, EventBus, EventHandler, MessageStore, QueueError, QueueEvent, QueueEventType,
    Result, RetryPolicy, Transport, Worker, WorkerPool, classifier::should_retry,
    retry::defaults as retry_defaults,
};

mod defaults {
    pub const fn num_workers() -> usize {
        4
    }

    pub const fn batch_size() -> usize {
        50
    }

    pub const fn poll_interval_ms() -> u64 {
        5000
    }

    pub const fn item_timeout_secs() -> u64 {
        300
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }

    pub const fn event_handler_timeout_ms() -> u64 {
        5000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Deliveries running at once.
    #[serde(default = "defaults::num_workers")]
    pub num_workers: usize,

    /// Items fetched per poll.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,

    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Backoff table; the last entry repeats.
    #[serde(default = "retry_defaults::intervals_secs")]
    pub retry_intervals_secs: Vec<u64>,

    /// Attempts per item. Defaults to the length of the backoff table.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Wall-clock limit for one delivery job, and the age at which a
    /// `processing` item is considered abandoned.
    #[serde(default = "defaults::item_timeout_secs")]
    pub item_timeout_secs: u64,

    /// How long [`QueueManager::stop`] waits for running deliveries when the
    /// configuration does not say otherwise.
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// How long an event handler may run before it is abandoned.
    #[serde(default = "defaults::event_handler_timeout_ms")]
    pub event_handler_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: defaults::num_workers(),
            batch_size: defaults::batch_size(),
            poll_interval_ms: defaults::poll_interval_ms(),
            retry_intervals_secs: retry_defaults::intervals_secs(),
            max_attempts: None,
            item_timeout_secs: defaults::item_timeout_secs(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            event_handler_timeout_ms: defaults::event_handler_timeout_ms(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Count of items per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub counts: HashMap<QueueStatus, usize>,
}

impl QueueStats {
    #[must_use]
    pub fn count(&self, status: QueueStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

pub struct QueueManagerBuilder {
    config: QueueConfig,
    store: Arc<dyn QueueStore>,
    messages: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
    signer: Option<Arc<DkimSigner>>,
    events: EventBus,
}

impl QueueManagerBuilder {
    #[must_use]
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Sign every message before each delivery attempt.
    #[must_use]
    pub fn delivery_signer(mut self, signer: Arc<DkimSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    #[must_use]
    pub fn event_handler(self, handler: Arc<dyn EventHandler>) -> Self {
        self.events.add_handler(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> QueueManager {
        let item_timeout = Duration::from_secs(self.config.item_timeout_secs);
        let batches = self.transport.batches_recipients();
        let events = self
            .events
            .with_handler_timeout(Duration::from_millis(self.config.event_handler_timeout_ms));

        QueueManager {
            inner: Arc::new(Inner {
                retry: RetryPolicy::new(self.config.retry_intervals_secs.clone()),
                pool: WorkerPool::new(self.config.num_workers),
                worker: Worker::new(self.transport, self.messages.clone(), self.signer, item_timeout),
                config: self.config,
                store: self.store,
                messages: self.messages,
                events,
                batches,
                started: AtomicBool::new(false),
                running: Mutex::new(None),
            }),
        }
    }
}

struct Running {
    shutdown: broadcast::Sender<Signal>,
    poller: JoinHandle<()>,
}

struct Inner {
    config: QueueConfig,
    retry: RetryPolicy,
    store: Arc<dyn QueueStore>,
    messages: Arc<dyn MessageStore>,
    worker: Worker,
    pool: WorkerPool,
    events: EventBus,
    /// Hand all claimed recipients of one message to the transport together.
    batches: bool,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
}

/// Owns the delivery queue. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.inner.config)
            .field("store", &self.inner.store)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    #[must_use]
    pub fn builder(
        store: Arc<dyn QueueStore>,
        messages: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
    ) -> QueueManagerBuilder {
        QueueManagerBuilder {
            config: QueueConfig::default(),
            store,
            messages,
            transport,
            signer: None,
            events: EventBus::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.events.add_handler(handler);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Persist a new pending obligation to deliver `message_id` to
    /// `recipient`.
    pub async fn enqueue(
        &self,
        message_id: &str,
        recipient: &str,
        priority: i32,
    ) -> Result<QueueItem> {
        let max_attempts = self
            .inner
            .config
            .max_attempts
            .unwrap_or_else(|| self.inner.retry.max_attempts())
            .max(1);

        let item = QueueItem::new(message_id, recipient, priority, max_attempts);
        self.inner.store.insert(&item).await?;

        debug!(id = %item.id, message_id, recipient, "Enqueued");
        self.inner
            .events
            .emit(QueueEvent::item(QueueEventType::MessageEnqueued, &item))
            .await;

        Ok(item)
    }

    /// Enqueue one item per distinct To/Cc/Bcc recipient of a stored
    /// message.
    pub async fn submit(&self, message_id: &str, priority: i32) -> Result<Vec<QueueItem>> {
        let message = self
            .inner
            .messages
            .get_message(message_id)
            .await
            .map_err(|err| QueueError::Message(err.to_string()))?;

        let recipients = message.recipients();
        if recipients.is_empty() {
            return Err(QueueError::Message(format!(
                "message {message_id} has no recipients"
            )));
        }

        let mut items = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            items.push(self.enqueue(message_id, &recipient, priority).await?);
        }
        Ok(items)
    }

    /// Recover abandoned items, then start the poll loop.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyRunning);
        }

        if let Err(err) = self.recover_stale().await {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let (shutdown, receiver) = broadcast::channel(4);
        let poller = tokio::spawn(Arc::clone(&self.inner).poll_loop(receiver));
        *self.inner.running.lock() = Some(Running { shutdown, poller });

        internal!(
            level = INFO,
            "Queue manager started with {} workers, polling every {}ms",
            self.inner.pool.size(),
            self.inner.config.poll_interval_ms
        );
        self.inner
            .events
            .emit(
                QueueEvent::queue(QueueEventType::QueueStarted)
                    .with("num_workers", self.inner.pool.size()),
            )
            .await;

        Ok(())
    }

    /// Stop polling and wait up to `timeout` for running deliveries.
    /// Deliveries still running after that are cancelled and their items
    /// put back to `pending`.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let running = self.inner.running.lock().take();
        let Some(running) = running else {
            return Err(QueueError::NotRunning);
        };

        internal!(level = INFO, "Queue manager stopping");
        let _ = running.shutdown.send(Signal::Shutdown);
        if let Err(err) = running.poller.await {
            error!(%err, "Queue poll loop ended abnormally");
        }

        let cancelled = self.inner.pool.shutdown(timeout).await;
        for item in cancelled {
            self.inner.release(item).await;
        }

        self.inner.started.store(false, Ordering::SeqCst);
        internal!(level = INFO, "Queue manager stopped");
        self.inner
            .events
            .emit(QueueEvent::queue(QueueEventType::QueueStopped))
            .await;

        Ok(())
    }

    /// Fetch and dispatch ready items once. Returns how many were claimed.
    pub async fn tick(&self) -> Result<usize> {
        Ok(Arc::clone(&self.inner).dispatch(None).await?.dispatched)
    }

    /// Wait for all running deliveries to finish and record their outcome.
    pub async fn wait_idle(&self) {
        self.inner.pool.wait_idle().await;
    }

    pub async fn get(&self, id: &QueueItemId) -> Result<QueueItem> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::ItemNotFound(id.clone()))
    }

    pub async fn list(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>> {
        Ok(self.inner.store.list(status).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.inner.store.list(None).await? {
            *stats.counts.entry(item.status).or_default() += 1;
        }
        Ok(stats)
    }

    /// Re-arm `failed` and `dead_letter` items: pending, no attempts, no
    /// error. With `id`, only that item, which must exist. Returns how many
    /// were re-armed.
    pub async fn retry_failed(&self, id: Option<&QueueItemId>) -> Result<usize> {
        let candidates = match id {
            Some(id) => vec![self.get(id).await?],
            None => {
                let mut items = self.inner.store.list(Some(QueueStatus::DeadLetter)).await?;
                items.extend(self.inner.store.list(Some(QueueStatus::Failed)).await?);
                items
            }
        };

        let mut requeued = 0;
        for mut item in candidates {
            if !matches!(item.status, QueueStatus::Failed | QueueStatus::DeadLetter) {
                continue;
            }

            item.status = QueueStatus::Pending;
            item.attempts = 0;
            item.next_attempt_at = None;
            item.error_message = None;
            item.updated_at = SystemTime::now();

            match self.inner.store.update(&item).await? {
                Some(written) => {
                    requeued += 1;
                    info!(id = %written.id, recipient = %written.recipient, "Requeued by operator");
                    self.inner
                        .events
                        .emit(QueueEvent::item(QueueEventType::MessageRequeued, &written))
                        .await;
                }
                None => warn!(id = %item.id, "Item changed while requeueing, skipped"),
            }
        }

        Ok(requeued)
    }

    /// Delete completed items last updated before `completed_before` and
    /// failed or dead-lettered ones last updated before `failed_before`.
    pub async fn purge_old(
        &self,
        completed_before: SystemTime,
        failed_before: SystemTime,
    ) -> Result<usize> {
        let purged = self.inner.store.purge(completed_before, failed_before).await?;

        internal!(level = INFO, "Purged {purged} old queue items");
        self.inner
            .events
            .emit(QueueEvent::queue(QueueEventType::QueuePurged).with("count", purged))
            .await;

        Ok(purged)
    }

    /// Reset `processing` items older than the item timeout to `pending`.
    /// Such items belong to a process that died mid-delivery. Items this
    /// manager is still delivering are left alone.
    pub async fn recover_stale(&self) -> Result<usize> {
        self.inner.recover_stale().await
    }
}

/// Outcome of one fetch-and-dispatch pass.
struct Pass {
    dispatched: usize,
    interrupted: bool,
}

impl Inner {
    async fn recover_stale(&self) -> Result<usize> {
        let now = SystemTime::now();
        let cutoff = now
            .checked_sub(Duration::from_secs(self.config.item_timeout_secs))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let busy = self.pool.in_flight_ids();
        let recovered = self.store.reset_stale(cutoff, now, &busy).await?;
        for item in &recovered {
            warn!(id = %item.id, recipient = %item.recipient, "Recovered abandoned item");
            self.events
                .emit(QueueEvent::item(QueueEventType::MessageRecovered, item))
                .await;
        }

        Ok(recovered.len())
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        // Claims abandoned after start() ran its sweep become stale later.
        let sweep_every = (Duration::from_secs(self.config.item_timeout_secs) / 2).max(interval);
        let mut last_sweep = tokio::time::Instant::now();

        loop {
            if last_sweep.elapsed() >= sweep_every {
                last_sweep = tokio::time::Instant::now();
                if let Err(err) = self.recover_stale().await {
                    error!(%err, "Stale item recovery failed");
                }
            }

            match Arc::clone(&self).dispatch(Some(&mut shutdown)).await {
                Ok(pass) if pass.interrupted => break,
                Ok(pass) if pass.dispatched > 0 => {
                    debug!(dispatched = pass.dispatched, "Dispatched queue items");
                }
                Ok(_) => {}
                Err(err) => error!(%err, "Queue poll failed"),
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                sig = shutdown.recv() => {
                    debug!(?sig, "Queue poll loop received shutdown");
                    break;
                }
            }
        }
    }

    /// Claim what is ready and start delivering it. Never waits for a
    /// delivery, only for a free worker.
    async fn dispatch(
        self: Arc<Self>,
        mut shutdown: Option<&mut broadcast::Receiver<Signal>>,
    ) -> Result<Pass> {
        let ready = self
            .store
            .fetch_ready(SystemTime::now(), self.config.batch_size)
            .await?;

        let mut pass = Pass {
            dispatched: 0,
            interrupted: false,
        };

        for job in self.jobs(ready) {
            let permit = tokio::select! {
                permit = self.pool.acquire() => permit,
                () = signalled(&mut shutdown) => {
                    pass.interrupted = true;
                    return Ok(pass);
                }
            };
            let Some(permit) = permit else {
                break;
            };

            let mut claimed = Vec::with_capacity(job.len());
            for item in job {
                match self.store.claim(&item.id, SystemTime::now()).await {
                    Ok(Some(item)) => claimed.push(item),
                    Ok(None) => debug!(id = %item.id, "Item claimed elsewhere"),
                    Err(err) => warn!(id = %item.id, %err, "Unable to claim item"),
                }
            }
            if claimed.is_empty() {
                continue;
            }

            for item in &claimed {
                self.events
                    .emit(QueueEvent::item(QueueEventType::MessageProcessing, item))
                    .await;
            }

            pass.dispatched += claimed.len();
            let inner = Arc::clone(&self);
            let items = claimed.clone();
            self.pool.spawn(permit, &claimed, async move {
                let results = inner.worker.process(&items).await;
                for (item, result) in items.into_iter().zip(results) {
                    inner.record(item, &result).await;
                }
            });
        }

        Ok(pass)
    }

    /// One job per item, or per message when the transport takes several
    /// recipients at once.
    fn jobs(&self, ready: Vec<QueueItem>) -> Vec<Vec<QueueItem>> {
        if !self.batches {
            return ready.into_iter().map(|item| vec![item]).collect();
        }

        let mut jobs: Vec<Vec<QueueItem>> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for item in ready {
            match index.get(&item.message_id) {
                Some(&at) => jobs[at].push(item),
                None => {
                    index.insert(item.message_id.clone(), jobs.len());
                    jobs.push(vec![item]);
                }
            }
        }
        jobs
    }

    /// Apply the outcome of an attempt to the claimed `item`.
    async fn record(&self, item: QueueItem, result: &DeliveryResult) {
        let now = SystemTime::now();
        let mut next = item;
        next.attempts = next.attempts.saturating_add(1).min(next.max_attempts);
        next.updated_at = now;

        let mut events = Vec::with_capacity(2);
        if result.is_success() {
            next.status = QueueStatus::Completed;
            next.next_attempt_at = None;
            next.error_message = None;
            events.push(QueueEventType::MessageSent);
        } else {
            let error_type = result.error_type.unwrap_or(crate::ErrorType::Unknown);
            next.error_message = Some(
                result
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| format!("delivery failed ({error_type})")),
            );

            if !should_retry(error_type) || next.attempts >= next.max_attempts {
                next.status = QueueStatus::DeadLetter;
                next.next_attempt_at = None;
                events.push(QueueEventType::MessageDeadLetter);
            } else {
                next.status = QueueStatus::Retrying;
                next.next_attempt_at = Some(self.retry.next_attempt_at(next.attempts, now));
                events.push(QueueEventType::MessageDeferred);
                events.push(QueueEventType::MessageRetryQueued);
            }
        }

        let written = match self.store.update(&next).await {
            Ok(Some(written)) => written,
            Ok(None) => {
                warn!(id = %next.id, "Item changed during delivery, outcome discarded");
                return;
            }
            Err(err) => {
                error!(id = %next.id, %err, "Unable to record delivery outcome");
                return;
            }
        };

        match written.status {
            QueueStatus::Completed => {
                info!(id = %written.id, recipient = %written.recipient, host = ?result.host, "Message delivered");
            }
            QueueStatus::DeadLetter => warn!(
                id = %written.id,
                recipient = %written.recipient,
                attempts = written.attempts,
                error = written.error_message.as_deref().unwrap_or_default(),
                "Message dead-lettered"
            ),
            _ => info!(
                id = %written.id,
                recipient = %written.recipient,
                attempts = written.attempts,
                next_attempt_at = ?written.next_attempt_at,
                "Delivery deferred"
            ),
        }

        for event_type in events {
            let mut event = QueueEvent::item(event_type, &written);
            if let Some(code) = result.smtp_code {
                event = event.with("smtp_code", code);
            }
            if let Some(error_type) = result.error_type {
                event = event.with("error_type", error_type);
            }
            if let Some(host) = &result.host {
                event = event.with("host", host);
            }
            if event_type == QueueEventType::MessageRetryQueued {
                event = event.with(
                    "delay_secs",
                    self.retry.delay_for_attempt(written.attempts).as_secs(),
                );
            }
            self.events.emit(event).await;
        }
    }

    /// Put an item whose delivery was cancelled back to `pending`.
    async fn release(&self, mut item: QueueItem) {
        item.status = QueueStatus::Pending;
        item.next_attempt_at = None;
        item.updated_at = SystemTime::now();

        match self.store.update(&item).await {
            Ok(Some(written)) => {
                self.events
                    .emit(QueueEvent::item(QueueEventType::MessageRecovered, &written))
                    .await;
            }
            Ok(None) => debug!(id = %item.id, "Cancelled item already recorded"),
            Err(err) => error!(id = %item.id, %err, "Unable to release cancelled item"),
        }
    }
}

/// Resolves when a shutdown signal arrives; never without a receiver.
async fn signalled(shutdown: &mut Option<&mut broadcast::Receiver<Signal>>) {
    match shutdown {
        Some(receiver) => {
            let _ = receiver.recv().await;
        }
        None => std::future::pending().await,
    }
}
