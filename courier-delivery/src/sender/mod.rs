//! The SMTP sender: turns one message and its recipients into
//! [`DeliveryResult`]s.

mod conversation;

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use courier_common::address::Address;
use courier_smtp::SmtpClient;
use serde::Deserialize;
use tracing::{debug, info, warn};

use self::conversation::Conversation;
use crate::{DeliveryError, DeliveryOutcome, DeliveryResult, MxRecord, MxResolver, SmtpTimeouts};

/// The seam between the worker pool and the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt delivery of `message` to one recipient. Never fails: every
    /// error is reported inside the result.
    async fn deliver(&self, message: &[u8], sender: &str, recipient: &str) -> DeliveryResult;

    /// One result per recipient, in order.
    async fn deliver_batch(
        &self,
        message: &[u8],
        sender: &str,
        recipients: &[String],
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            results.push(self.deliver(message, sender, recipient).await);
        }
        results
    }

    /// Whether several recipients of one message should be handed over
    /// together through [`Transport::deliver_batch`].
    fn batches_recipients(&self) -> bool {
        false
    }
}

mod defaults {
    pub fn helo_name() -> String {
        "localhost".to_string()
    }

    pub const fn starttls() -> bool {
        true
    }

    pub const fn relay_port() -> u16 {
        587
    }
}

/// A smarthost that takes every message instead of the recipients' MX.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    #[serde(default = "defaults::relay_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "defaults::starttls")]
    pub starttls: bool,
}

impl RelayConfig {
    fn address(&self) -> String {
        MxRecord::new(0, self.host.clone(), self.port).address()
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref().unwrap_or_default()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// Name announced in EHLO/HELO.
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    /// Upgrade with STARTTLS when the server offers it.
    #[serde(default = "defaults::starttls")]
    pub starttls: bool,

    /// Accept any TLS certificate. Test deployments only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub relay: Option<RelayConfig>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            helo_name: defaults::helo_name(),
            timeouts: SmtpTimeouts::default(),
            starttls: defaults::starttls(),
            accept_invalid_certs: false,
            relay: None,
        }
    }
}

/// Delivers directly to the recipient's mail exchangers, or through the
/// configured relay.
///
/// Direct delivery walks the MX list in priority order and stops at the
/// first success or the first permanent failure. Temporary failures move on
/// to the next host; if every host fails temporarily the result is deferred
/// with the last error seen.
#[derive(Debug, Clone)]
pub struct SmtpSender {
    config: SenderConfig,
    resolver: Arc<MxResolver>,
}

impl SmtpSender {
    #[must_use]
    pub const fn new(config: SenderConfig, resolver: Arc<MxResolver>) -> Self {
        Self { config, resolver }
    }

    fn conversation<'a>(&'a self, address: String, host: &'a str, starttls: bool) -> Conversation<'a> {
        Conversation {
            address,
            host,
            helo_name: &self.config.helo_name,
            timeouts: &self.config.timeouts,
            starttls,
            accept_invalid_certs: self.config.accept_invalid_certs,
        }
    }

    async fn deliver_to_host(
        &self,
        mx: &MxRecord,
        message: &[u8],
        sender: &str,
        recipient: &str,
    ) -> Result<(), DeliveryError> {
        let conversation = self.conversation(mx.address(), &mx.host, self.config.starttls);

        let mut client = conversation.open().await?;
        conversation
            .mail_from(&mut client, sender, message.len())
            .await?;
        conversation.rcpt_to(&mut client, recipient).await?;
        conversation.data(&mut client, message).await?;
        conversation.quit(&mut client).await;

        Ok(())
    }

    #[tracing::instrument(skip(self, message), fields(size = message.len()))]
    async fn deliver_direct(&self, message: &[u8], sender: &str, recipient: &Address) -> DeliveryResult {
        let started = Instant::now();
        let rcpt = recipient.to_string();

        let hosts = match self.resolver.resolve(recipient.domain()).await {
            Ok(hosts) => hosts,
            Err(err) => {
                return DeliveryResult::failed(rcpt, &err.into(), None)
                    .with_duration(started.elapsed());
            }
        };

        let mut tried = Vec::with_capacity(hosts.len());
        let mut last = None;

        for mx in hosts.iter() {
            tried.push(mx.address());

            match self.deliver_to_host(mx, message, sender, &rcpt).await {
                Ok(()) => {
                    info!(host = %mx.address(), recipient = %rcpt, "Delivered");
                    return DeliveryResult::delivered(&rcpt, mx.address())
                        .with_hosts_tried(tried)
                        .with_duration(started.elapsed());
                }
                Err(err) => {
                    let result = DeliveryResult::failed(&rcpt, &err, Some(mx.address()));
                    if result.outcome == DeliveryOutcome::Bounced {
                        warn!(host = %mx.address(), recipient = %rcpt, %err, "Permanent failure");
                        return result
                            .with_hosts_tried(tried)
                            .with_duration(started.elapsed());
                    }

                    debug!(host = %mx.address(), recipient = %rcpt, %err, "Temporary failure, trying next host");
                    last = Some(result);
                }
            }
        }

        last.unwrap_or_else(|| {
            DeliveryResult::failed(
                &rcpt,
                &DeliveryError::NoMailServers(recipient.domain().to_string()),
                None,
            )
        })
        .with_hosts_tried(tried)
        .with_duration(started.elapsed())
    }

    /// Everything through one relay connection. Recipients refused at RCPT
    /// get their own result; accepted ones share the outcome of DATA. A
    /// failure before RCPT, including refused credentials, fails them all.
    #[tracing::instrument(skip_all, fields(relay = %relay.address(), recipients = recipients.len()))]
    async fn deliver_relay(
        &self,
        relay: &RelayConfig,
        message: &[u8],
        sender: &str,
        recipients: &[String],
    ) -> Vec<DeliveryResult> {
        let started = Instant::now();
        let host = relay.address();
        let mut slots: Vec<Option<DeliveryResult>> = vec![None; recipients.len()];

        // Refuse malformed addresses without touching the network.
        let mut pending = Vec::with_capacity(recipients.len());
        for (slot, recipient) in slots.iter_mut().zip(recipients) {
            match Address::parse(recipient) {
                Ok(address) => pending.push(address.to_string()),
                Err(err) => *slot = Some(DeliveryResult::failed(recipient, &err.into(), None)),
            }
        }

        let fail = |rcpt: &str, err: &DeliveryError| {
            DeliveryResult::failed(rcpt, err, Some(host.clone()))
        };
        let mut outcomes = Vec::new();

        if !pending.is_empty() {
            match self.relay_envelope(relay, message, sender).await {
                Ok((conversation, mut client)) => {
                    let mut broken = None;
                    for rcpt in &pending {
                        if let Some(err) = &broken {
                            outcomes.push(fail(rcpt, err));
                            continue;
                        }
                        match conversation.rcpt_to(&mut client, rcpt).await {
                            Ok(()) => outcomes.push(DeliveryResult::delivered(rcpt, &host)),
                            Err(err @ DeliveryError::Smtp { .. }) => {
                                outcomes.push(fail(rcpt, &err));
                            }
                            Err(err) => {
                                // The connection is gone; nobody after this is delivered.
                                outcomes.push(fail(rcpt, &err));
                                broken = Some(err);
                            }
                        }
                    }

                    // Recipients accepted at RCPT now share the fate of DATA.
                    let transferred = match broken {
                        Some(err) => Err(err),
                        None if outcomes.iter().any(DeliveryResult::is_success) => {
                            conversation.data(&mut client, message).await
                        }
                        None => Ok(()),
                    };
                    if let Err(err) = transferred {
                        for result in outcomes.iter_mut().filter(|r| r.is_success()) {
                            *result = fail(&result.recipient, &err);
                        }
                    }
                    conversation.quit(&mut client).await;
                }
                Err(err) => {
                    warn!(%err, "Relay delivery failed before any recipient");
                    outcomes.extend(pending.iter().map(|rcpt| fail(rcpt, &err)));
                }
            }
        }

        let mut delivered = outcomes.into_iter();
        slots
            .into_iter()
            .map(|slot| {
                slot.or_else(|| delivered.next())
                    .unwrap_or_else(|| {
                        fail("", &DeliveryError::NoMailServers(relay.host.clone()))
                    })
                    .with_duration(started.elapsed())
            })
            .collect()
    }

    /// Connect to the relay, authenticate when configured, and open the
    /// transaction with MAIL FROM.
    async fn relay_envelope<'a>(
        &'a self,
        relay: &'a RelayConfig,
        message: &[u8],
        sender: &str,
    ) -> Result<(Conversation<'a>, SmtpClient), DeliveryError> {
        let conversation = self.conversation(relay.address(), &relay.host, relay.starttls);
        let mut client = conversation.open().await?;

        if let Some((username, password)) = relay.credentials()
            && let Err(err) = conversation.authenticate(&mut client, username, password).await
        {
            conversation.quit(&mut client).await;
            return Err(err);
        }

        if let Err(err) = conversation
            .mail_from(&mut client, sender, message.len())
            .await
        {
            conversation.quit(&mut client).await;
            return Err(err);
        }

        Ok((conversation, client))
    }

    fn check_sender(sender: &str) -> Result<(), DeliveryError> {
        // The null reverse path is valid for bounces.
        if sender.is_empty() {
            return Ok(());
        }
        Address::parse(sender).map(|_| ()).map_err(Into::into)
    }
}

#[async_trait]
impl Transport for SmtpSender {
    async fn deliver(&self, message: &[u8], sender: &str, recipient: &str) -> DeliveryResult {
        if self.config.relay.is_some() {
            let recipients = [recipient.to_string()];
            if let Some(result) = self.deliver_batch(message, sender, &recipients).await.pop() {
                return result;
            }
        }

        if let Err(err) = Self::check_sender(sender) {
            return DeliveryResult::failed(recipient, &err, None);
        }

        match Address::parse(recipient) {
            Ok(address) => self.deliver_direct(message, sender, &address).await,
            Err(err) => DeliveryResult::failed(recipient, &err.into(), None),
        }
    }

    async fn deliver_batch(
        &self,
        message: &[u8],
        sender: &str,
        recipients: &[String],
    ) -> Vec<DeliveryResult> {
        if let Err(err) = Self::check_sender(sender) {
            let failed = DeliveryResult::failed("", &err, None);
            return recipients
                .iter()
                .map(|rcpt| DeliveryResult {
                    recipient: rcpt.clone(),
                    ..failed.clone()
                })
                .collect();
        }

        if let Some(relay) = &self.config.relay {
            return self.deliver_relay(relay, message, sender, recipients).await;
        }

        let mut results = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            results.push(self.deliver(message, sender, recipient).await);
        }
        results
    }

    fn batches_recipients(&self) -> bool {
        self.config.relay.is_some()
    }
}
