mod support;

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use courier_delivery::{
    DeliveryError, DeliveryResult, EventHandler, MemoryMessageStore, QueueConfig, QueueError,
    QueueEvent, QueueEventType, QueueManager, SenderConfig, SmtpSender, Transport,
};
use courier_dkim::DkimSigner;
use courier_queue::{MemoryQueueStore, QueueItem, QueueStatus, QueueStore};
use pretty_assertions::assert_eq;
use support::{MESSAGE, StaticMx};
use tokio::sync::broadcast;

const KEY: &str = include_str!("../../courier-dkim/tests/fixtures/test_key.pem");

#[derive(Debug, Clone, Copy)]
enum Step {
    Deliver,
    Fail(u16, &'static str),
    Hang,
}

/// Replays a fixed sequence of outcomes, then delivers.
#[derive(Default)]
struct Scripted {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<(Vec<u8>, Vec<String>)>>,
    batches: bool,
    running: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
}

impl Scripted {
    fn new(steps: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.iter().copied().collect()),
            ..Self::default()
        })
    }

    fn calls(&self) -> Vec<(Vec<u8>, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    async fn outcome(&self, recipient: &str) -> DeliveryResult {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Deliver);

        match step {
            Step::Deliver => DeliveryResult::delivered(recipient, "mx.example.com:25"),
            Step::Fail(code, message) => DeliveryResult::failed(
                recipient,
                &DeliveryError::Smtp {
                    stage: "RCPT TO",
                    host: "mx.example.com:25".into(),
                    code,
                    message: message.into(),
                },
                Some("mx.example.com:25".into()),
            ),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                DeliveryResult::delivered(recipient, "mx.example.com:25")
            }
        }
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn deliver(&self, message: &[u8], _sender: &str, recipient: &str) -> DeliveryResult {
        self.calls
            .lock()
            .unwrap()
            .push((message.to_vec(), vec![recipient.to_string()]));

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.outcome(recipient).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn deliver_batch(
        &self,
        message: &[u8],
        _sender: &str,
        recipients: &[String],
    ) -> Vec<DeliveryResult> {
        self.calls
            .lock()
            .unwrap()
            .push((message.to_vec(), recipients.to_vec()));

        let mut results = Vec::new();
        for recipient in recipients {
            results.push(self.outcome(recipient).await);
        }
        results
    }

    fn batches_recipients(&self) -> bool {
        self.batches
    }
}

struct Harness {
    manager: QueueManager,
    store: Arc<MemoryQueueStore>,
    messages: MemoryMessageStore,
}

impl Harness {
    fn new(transport: Arc<dyn Transport>, config: QueueConfig) -> Self {
        let store = Arc::new(MemoryQueueStore::new());
        let messages = MemoryMessageStore::new();
        messages.insert("msg-1", MESSAGE).unwrap();

        let manager = QueueManager::builder(store.clone(), Arc::new(messages.clone()), transport)
            .config(config)
            .build();

        Self {
            manager,
            store,
            messages,
        }
    }

    /// One poll, then wait for every dispatched delivery to be recorded.
    async fn run_once(&self) -> usize {
        let dispatched = self.manager.tick().await.unwrap();
        self.manager.wait_idle().await;
        dispatched
    }

    async fn item(&self, item: &QueueItem) -> QueueItem {
        self.manager.get(&item.id).await.unwrap()
    }
}

/// Retries are due immediately.
fn immediate_retries() -> QueueConfig {
    QueueConfig {
        retry_intervals_secs: vec![0],
        max_attempts: Some(5),
        ..QueueConfig::default()
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<QueueEvent>,
    event_type: QueueEventType,
) -> QueueEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {event_type} event"))
}

#[tokio::test]
async fn nonexistent_domain_dead_letters_on_the_first_attempt() {
    let sender = SmtpSender::new(SenderConfig::default(), StaticMx::default().resolver());
    let harness = Harness::new(Arc::new(sender), QueueConfig::default());

    let item = harness
        .manager
        .enqueue("msg-1", "user@nonexistent-tld-xyz.invalid", 0)
        .await
        .unwrap();
    assert_eq!(harness.run_once().await, 1);

    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::DeadLetter);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.next_attempt_at, None);
    let error = item.error_message.unwrap();
    assert!(error.contains("domain does not exist"), "{error}");
}

#[tokio::test]
async fn completes_after_two_temporary_failures() {
    let transport = Scripted::new(&[
        Step::Fail(421, "4.7.0 Try again later"),
        Step::Fail(421, "4.7.0 Try again later"),
    ]);
    let harness = Harness::new(transport.clone(), immediate_retries());
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();

    harness.run_once().await;
    let after_first = harness.item(&item).await;
    assert_eq!(after_first.status, QueueStatus::Retrying);
    assert_eq!(after_first.attempts, 1);
    assert!(after_first.next_attempt_at.is_some());
    assert!(after_first.error_message.unwrap().contains("421"));

    harness.run_once().await;
    assert_eq!(harness.item(&item).await.status, QueueStatus::Retrying);

    harness.run_once().await;
    let done = harness.item(&item).await;
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.attempts, 3);
    assert_eq!(done.next_attempt_at, None);
    assert_eq!(done.error_message, None);
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test]
async fn first_retry_waits_the_first_interval() {
    let harness = Harness::new(
        Scripted::new(&[Step::Fail(450, "4.2.1 Mailbox busy")]),
        QueueConfig::default(),
    );
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();
    assert_eq!(item.max_attempts, 5);

    let before = SystemTime::now();
    harness.run_once().await;
    let after = SystemTime::now();

    let item = harness.item(&item).await;
    let next = item.next_attempt_at.unwrap();
    assert!(next >= before + Duration::from_secs(300));
    assert!(next <= after + Duration::from_secs(300));

    // Not due yet.
    assert_eq!(harness.run_once().await, 0);
}

#[tokio::test]
async fn exhausting_attempts_dead_letters_with_the_last_error() {
    let transport = Scripted::new(&[
        Step::Fail(421, "4.3.2 Service shutting down"),
        Step::Fail(451, "4.3.0 Local error"),
        Step::Fail(421, "unused"),
    ]);
    let harness = Harness::new(
        transport.clone(),
        QueueConfig {
            max_attempts: Some(2),
            ..immediate_retries()
        },
    );
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();

    for _ in 0..4 {
        harness.run_once().await;
        let current = harness.item(&item).await;
        assert!(current.attempts <= current.max_attempts);
    }

    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::DeadLetter);
    assert_eq!(item.attempts, 2);
    assert!(item.error_message.unwrap().contains("451 4.3.0 Local error"));
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let harness = Harness::new(
        Scripted::new(&[Step::Fail(550, "5.1.1 User unknown")]),
        QueueConfig::default(),
    );
    let mut events = harness.manager.subscribe();
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();

    harness.run_once().await;

    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::DeadLetter);
    assert_eq!(item.attempts, 1);

    let event = next_event(&mut events, QueueEventType::MessageDeadLetter).await;
    assert_eq!(event.queue_item_id, Some(item.id));
    assert_eq!(event.metadata["error_type"], "invalid_recipient");
    assert_eq!(event.metadata["smtp_code"], "550");
    assert!(event.error.unwrap().contains("User unknown"));
}

#[tokio::test(start_paused = true)]
async fn hung_delivery_times_out_and_is_retried() {
    let harness = Harness::new(Scripted::new(&[Step::Hang]), QueueConfig::default());
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();

    harness.run_once().await;

    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::Retrying);
    assert_eq!(item.attempts, 1);
    assert!(item.error_message.unwrap().contains("exceeded 300s"));
}

#[tokio::test]
async fn deferral_emits_deferred_then_retry_queued() {
    let harness = Harness::new(
        Scripted::new(&[Step::Fail(421, "4.7.0 Try later")]),
        QueueConfig::default(),
    );
    let mut events = harness.manager.subscribe();
    harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();
    harness.run_once().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(
        seen,
        vec![
            QueueEventType::MessageEnqueued,
            QueueEventType::MessageProcessing,
            QueueEventType::MessageDeferred,
            QueueEventType::MessageRetryQueued,
        ]
    );
}

#[tokio::test]
async fn workers_are_bounded() {
    let transport = Arc::new(Scripted {
        delay: Some(Duration::from_millis(30)),
        ..Scripted::default()
    });
    let harness = Harness::new(
        transport.clone(),
        QueueConfig {
            num_workers: 2,
            ..QueueConfig::default()
        },
    );
    for i in 0..8 {
        harness
            .manager
            .enqueue("msg-1", &format!("user{i}@example.com"), 0)
            .await
            .unwrap();
    }

    assert_eq!(harness.run_once().await, 8);
    assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    assert_eq!(
        harness.manager.stats().await.unwrap().count(QueueStatus::Completed),
        8
    );
}

#[tokio::test]
async fn batching_transport_gets_one_job_per_message() {
    let transport = Arc::new(Scripted {
        batches: true,
        ..Scripted::default()
    });
    let harness = Harness::new(transport.clone(), QueueConfig::default());
    harness
        .messages
        .insert(
            "msg-2",
            b"From: alice@example.org\r\nTo: a@example.com, b@example.com\r\nCc: A@example.com\r\nBcc: c@example.com\r\n\r\nHi\r\n",
        )
        .unwrap();

    let items = harness.manager.submit("msg-2", 0).await.unwrap();
    assert_eq!(items.len(), 3);

    harness.run_once().await;
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    let mut recipients = calls[0].1.clone();
    recipients.sort();
    assert_eq!(
        recipients,
        vec!["a@example.com", "b@example.com", "c@example.com"]
    );
    assert!(!String::from_utf8_lossy(&calls[0].0).contains("Bcc"));
}

#[tokio::test]
async fn submit_without_recipients_is_refused() {
    let harness = Harness::new(Scripted::new(&[]), QueueConfig::default());
    harness
        .messages
        .insert("empty", b"From: alice@example.org\r\nSubject: x\r\n\r\nHi\r\n")
        .unwrap();

    assert!(matches!(
        harness.manager.submit("empty", 0).await,
        Err(QueueError::Message(_))
    ));
    assert!(matches!(
        harness.manager.submit("missing", 0).await,
        Err(QueueError::Message(_))
    ));
}

#[tokio::test]
async fn missing_message_dead_letters() {
    let harness = Harness::new(Scripted::new(&[]), QueueConfig::default());
    let item = harness
        .manager
        .enqueue("gone", "bob@example.com", 0)
        .await
        .unwrap();

    harness.run_once().await;
    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::DeadLetter);
    assert!(item.error_message.unwrap().contains("not found"));
}

#[tokio::test]
async fn delivery_time_signing() {
    let transport = Scripted::new(&[]);
    let store = Arc::new(MemoryQueueStore::new());
    let messages = MemoryMessageStore::new();
    messages.insert("signed", MESSAGE).unwrap();
    messages
        .insert("no-from", b"To: bob@example.com\r\n\r\nHi\r\n")
        .unwrap();

    let signer = DkimSigner::from_pem("example.org", "test", KEY).unwrap();
    let manager = QueueManager::builder(store, Arc::new(messages), transport.clone())
        .delivery_signer(Arc::new(signer))
        .build();

    let signed = manager.enqueue("signed", "bob@example.com", 0).await.unwrap();
    let unsignable = manager.enqueue("no-from", "bob@example.com", 0).await.unwrap();
    manager.tick().await.unwrap();
    manager.wait_idle().await;

    assert_eq!(manager.get(&signed.id).await.unwrap().status, QueueStatus::Completed);
    assert!(transport.calls()[0].0.starts_with(b"DKIM-Signature:"));

    let unsignable = manager.get(&unsignable.id).await.unwrap();
    assert_eq!(unsignable.status, QueueStatus::DeadLetter);
    assert_eq!(unsignable.attempts, 1);
    assert!(unsignable.error_message.unwrap().contains("DKIM"));
}

#[tokio::test]
async fn retry_failed_rearms_dead_letters() {
    let harness = Harness::new(
        Scripted::new(&[Step::Fail(550, "5.1.1 User unknown")]),
        QueueConfig::default(),
    );
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();
    harness.run_once().await;
    assert_eq!(harness.item(&item).await.status, QueueStatus::DeadLetter);

    assert_eq!(harness.manager.retry_failed(None).await.unwrap(), 1);
    let rearmed = harness.item(&item).await;
    assert_eq!(rearmed.status, QueueStatus::Pending);
    assert_eq!(rearmed.attempts, 0);
    assert_eq!(rearmed.error_message, None);

    // Only failed and dead-lettered items qualify.
    assert_eq!(harness.manager.retry_failed(Some(&item.id)).await.unwrap(), 0);

    harness.run_once().await;
    assert_eq!(harness.item(&item).await.status, QueueStatus::Completed);

    let unknown = QueueItem::new("msg-1", "x@example.com", 0, 5).id;
    assert!(matches!(
        harness.manager.retry_failed(Some(&unknown)).await,
        Err(QueueError::ItemNotFound(_))
    ));
}

#[tokio::test]
async fn purge_removes_only_old_terminal_items() {
    let harness = Harness::new(Scripted::new(&[]), QueueConfig::default());
    let mut events = harness.manager.subscribe();

    let done = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();
    harness.run_once().await;
    let waiting = harness
        .manager
        .enqueue("msg-1", "carol@example.com", 0)
        .await
        .unwrap();

    let later = SystemTime::now() + Duration::from_secs(1);
    assert_eq!(harness.manager.purge_old(later, later).await.unwrap(), 1);

    assert!(matches!(
        harness.manager.get(&done.id).await,
        Err(QueueError::ItemNotFound(_))
    ));
    assert_eq!(harness.item(&waiting).await.status, QueueStatus::Pending);

    let event = next_event(&mut events, QueueEventType::QueuePurged).await;
    assert_eq!(event.metadata["count"], "1");
}

#[tokio::test]
async fn start_recovers_abandoned_items() {
    let harness = Harness::new(Scripted::new(&[]), QueueConfig::default());
    let item = QueueItem::new("msg-1", "bob@example.com", 0, 5);
    harness.store.insert(&item).await.unwrap();
    harness
        .store
        .claim(&item.id, SystemTime::now() - Duration::from_secs(3600))
        .await
        .unwrap()
        .unwrap();

    // A fresh claim is not abandoned.
    let fresh = QueueItem::new("msg-1", "carol@example.com", 0, 5);
    harness.store.insert(&fresh).await.unwrap();
    harness
        .store
        .claim(&fresh.id, SystemTime::now())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(harness.manager.recover_stale().await.unwrap(), 1);
    assert_eq!(harness.item(&item).await.status, QueueStatus::Pending);
    assert_eq!(harness.item(&fresh).await.status, QueueStatus::Processing);
}

#[tokio::test]
async fn claims_abandoned_after_start_are_recovered_while_running() {
    let harness = Harness::new(
        Scripted::new(&[]),
        QueueConfig {
            poll_interval_ms: 50,
            item_timeout_secs: 1,
            ..QueueConfig::default()
        },
    );
    let item = QueueItem::new("msg-1", "bob@example.com", 0, 5);
    harness.store.insert(&item).await.unwrap();
    harness
        .store
        .claim(&item.id, SystemTime::now())
        .await
        .unwrap()
        .unwrap();

    harness.manager.start().await.unwrap();
    assert_eq!(harness.item(&item).await.status, QueueStatus::Processing);

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.item(&item).await.status != QueueStatus::Completed {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("abandoned claim was never recovered");

    harness.manager.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn running_deliveries_are_not_recovered() {
    let transport = Scripted::new(&[Step::Hang]);
    let harness = Harness::new(
        transport.clone(),
        QueueConfig {
            poll_interval_ms: 50,
            item_timeout_secs: 1,
            retry_intervals_secs: vec![3600],
            ..QueueConfig::default()
        },
    );
    let mut events = harness.manager.subscribe();
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();

    harness.manager.start().await.unwrap();
    next_event(&mut events, QueueEventType::MessageProcessing).await;

    // The hung attempt outlives a sweep interval and then times out.
    next_event(&mut events, QueueEventType::MessageRetryQueued).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::Retrying);
    assert_eq!(item.attempts, 1);
    assert_eq!(transport.calls().len(), 1);

    harness.manager.stop(Duration::from_secs(5)).await.unwrap();
}

struct Hung;

#[async_trait]
impl EventHandler for Hung {
    async fn handle(&self, _: &QueueEvent) -> anyhow::Result<()> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn hung_event_handlers_do_not_block_the_queue() {
    let messages = MemoryMessageStore::new();
    messages.insert("msg-1", MESSAGE).unwrap();
    let manager = QueueManager::builder(
        Arc::new(MemoryQueueStore::new()),
        Arc::new(messages),
        Scripted::new(&[]),
    )
    .config(QueueConfig {
        event_handler_timeout_ms: 100,
        ..QueueConfig::default()
    })
    .event_handler(Arc::new(Hung))
    .build();
    let mut events = manager.subscribe();

    let item = tokio::time::timeout(
        Duration::from_secs(2),
        manager.enqueue("msg-1", "bob@example.com", 0),
    )
    .await
    .expect("enqueue waited on a hung handler")
    .unwrap();

    let enqueued = next_event(&mut events, QueueEventType::MessageEnqueued).await;
    assert_eq!(enqueued.queue_item_id, Some(item.id));
}

#[tokio::test]
async fn lifecycle() {
    let harness = Harness::new(
        Scripted::new(&[]),
        QueueConfig {
            poll_interval_ms: 10,
            ..QueueConfig::default()
        },
    );
    let mut events = harness.manager.subscribe();

    assert!(matches!(
        harness.manager.stop(Duration::from_secs(1)).await,
        Err(QueueError::NotRunning)
    ));

    harness.manager.start().await.unwrap();
    assert!(harness.manager.is_running());
    assert!(matches!(
        harness.manager.start().await,
        Err(QueueError::AlreadyRunning)
    ));
    next_event(&mut events, QueueEventType::QueueStarted).await;

    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();
    let sent = next_event(&mut events, QueueEventType::MessageSent).await;
    assert_eq!(sent.queue_item_id, Some(item.id.clone()));

    harness.manager.stop(Duration::from_secs(5)).await.unwrap();
    assert!(!harness.manager.is_running());
    next_event(&mut events, QueueEventType::QueueStopped).await;
    assert_eq!(harness.item(&item).await.status, QueueStatus::Completed);

    // Restartable.
    harness.manager.start().await.unwrap();
    harness.manager.stop(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn stop_returns_cancelled_items_to_pending() {
    let harness = Harness::new(
        Scripted::new(&[Step::Hang]),
        QueueConfig {
            poll_interval_ms: 10,
            ..QueueConfig::default()
        },
    );
    let mut events = harness.manager.subscribe();
    let item = harness
        .manager
        .enqueue("msg-1", "bob@example.com", 0)
        .await
        .unwrap();

    harness.manager.start().await.unwrap();
    next_event(&mut events, QueueEventType::MessageProcessing).await;

    harness
        .manager
        .stop(Duration::from_millis(100))
        .await
        .unwrap();

    let item = harness.item(&item).await;
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 0);
}
