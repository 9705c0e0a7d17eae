//! Outbound delivery for courier
//!
//! This crate provides:
//! - MX resolution with caching and the implicit-MX fallback
//! - An SMTP sender that walks a domain's mail exchangers, or uses a relay
//! - Classification of failed attempts into retryable and permanent types
//! - The queue manager: poll loop, bounded worker pool, retry scheduling
//!   and dead-lettering

pub mod classifier;
mod dns;
mod error;
mod events;
mod manager;
mod message;
mod retry;
mod sender;
mod types;
mod worker;

pub use classifier::{ErrorType, FailureKind, classify, should_retry};
pub use dns::{DnsConfig, DnsError, HickoryLookup, MxAnswer, MxLookup, MxRecord, MxResolver};
pub use error::{DeliveryError, QueueError, Result};
pub use events::{EventBus, EventHandler, LoggingEventHandler, QueueEvent, QueueEventType};
pub use manager::{QueueConfig, QueueManager, QueueManagerBuilder, QueueStats};
pub use message::{
    FileMessageStore, MemoryMessageStore, MessageError, MessageStore, StoredMessage,
};
pub use retry::RetryPolicy;
pub use sender::{RelayConfig, SenderConfig, SmtpSender, Transport};
pub use types::{DeliveryOutcome, DeliveryResult, SmtpTimeouts};
pub use worker::{Worker, WorkerPool};
