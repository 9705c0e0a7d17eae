use std::{sync::Arc, time::Duration};

use courier_common::internal;
use courier_delivery::{
    FileMessageStore, LoggingEventHandler, MxResolver, QueueManager, SmtpSender,
};
use courier_dkim::{DkimSigner, SigningStage};
use courier_queue::QueueItem;

use crate::config::Courier;

/// A wired-up delivery pipeline, built from a [`Courier`] configuration.
#[derive(Debug)]
pub struct Controller {
    manager: QueueManager,
    messages: FileMessageStore,
    /// Signs messages as they are submitted. `None` when DKIM is off or
    /// signing happens at delivery time.
    compose_signer: Option<Arc<DkimSigner>>,
    shutdown_timeout: Duration,
}

impl Courier {
    /// Open the stores, build the resolver, sender and signer, and assemble
    /// the queue manager.
    pub fn init(self) -> anyhow::Result<Controller> {
        let resolver = Arc::new(MxResolver::system(self.dns.clone())?);
        self.init_with(resolver)
    }

    /// [`Courier::init`] with a caller supplied MX resolver.
    pub fn init_with(self, resolver: Arc<MxResolver>) -> anyhow::Result<Controller> {
        let store = self.store.into_store()?;
        let messages = Arc::new(self.messages.clone());
        let transport = Arc::new(SmtpSender::new(self.sender, resolver));

        let shutdown_timeout = self.queue.shutdown_timeout();
        let mut builder = QueueManager::builder(store, messages, transport)
            .config(self.queue)
            .event_handler(Arc::new(LoggingEventHandler));

        let mut compose_signer = None;
        if let Some(dkim) = &self.dkim {
            let signer = Arc::new(DkimSigner::from_config(dkim)?);
            internal!(
                level = INFO,
                "DKIM signing as {}._domainkey.{} at {:?}",
                dkim.selector,
                signer.domain(),
                dkim.sign_at
            );
            match dkim.sign_at {
                SigningStage::Compose => compose_signer = Some(signer),
                SigningStage::Delivery => builder = builder.delivery_signer(signer),
            }
        }

        Ok(Controller {
            manager: builder.build(),
            messages: self.messages,
            compose_signer,
            shutdown_timeout,
        })
    }
}

impl Controller {
    #[must_use]
    pub const fn manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Store a composed message under a fresh id and queue one item per
    /// recipient. The message is signed first when DKIM signs at compose
    /// time.
    pub async fn submit(&self, raw: &[u8], priority: i32) -> anyhow::Result<(String, Vec<QueueItem>)> {
        let raw = match &self.compose_signer {
            Some(signer) => signer.sign_message(raw)?,
            None => raw.to_vec(),
        };

        let id = ulid::Ulid::new().to_string();
        self.messages.put(&id, &raw).await?;

        match self.manager.submit(&id, priority).await {
            Ok(items) => Ok((id, items)),
            Err(err) => {
                self.messages.remove(&id).await?;
                Err(err.into())
            }
        }
    }

    /// Deliver until Ctrl-C or SIGTERM, then stop gracefully.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(&self) -> anyhow::Result<()> {
        self.manager.start().await?;
        internal!(level = INFO, "Controller running");

        let signalled = shutdown().await;
        internal!(level = INFO, "Shutting down...");

        self.manager.stop(self.shutdown_timeout).await?;
        signalled
    }
}

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    }

    Ok(())
}
