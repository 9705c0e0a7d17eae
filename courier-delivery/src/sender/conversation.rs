//! One SMTP conversation with one server.
//!
//! Each step enforces its own timeout from [`SmtpTimeouts`] and turns a
//! failure reply into [`DeliveryError::Smtp`] tagged with the step, so the
//! classifier sees the server's code.

use std::{future::Future, time::Duration};

use courier_common::tracing;
use courier_smtp::{ClientError, Response, SmtpClient};

use crate::{DeliveryError, SmtpTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsOutcome {
    Upgraded,
    Skipped,
    /// The handshake broke the connection; start over in plaintext.
    Reconnect,
}

pub struct Conversation<'a> {
    /// `host:port` to connect to.
    pub address: String,
    /// Name used for TLS verification and in errors.
    pub host: &'a str,
    pub helo_name: &'a str,
    pub timeouts: &'a SmtpTimeouts,
    pub starttls: bool,
    pub accept_invalid_certs: bool,
}

impl Conversation<'_> {
    async fn timed<T, F>(&self, secs: u64, stage: &str, fut: F) -> Result<T, DeliveryError>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        let limit = Duration::from_secs(secs);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeliveryError::Timeout(format!(
                "{stage} with {} after {limit:?}",
                self.address
            ))),
        }
    }

    fn expect(
        &self,
        response: &Response,
        stage: &'static str,
        accept: fn(&Response) -> bool,
    ) -> Result<(), DeliveryError> {
        if accept(response) {
            Ok(())
        } else {
            Err(DeliveryError::Smtp {
                stage,
                host: self.address.clone(),
                code: response.code,
                message: response.lines.join(" ").trim().to_string(),
            })
        }
    }

    /// Connect, read the greeting, say hello and upgrade to TLS when the
    /// server offers it. A failed upgrade falls back to plaintext.
    pub async fn open(&self) -> Result<SmtpClient, DeliveryError> {
        let mut client = self.connect_and_greet().await?;
        self.hello(&mut client).await?;

        if self.negotiate_tls(&mut client).await? == TlsOutcome::Reconnect {
            tracing::info!(
                server = %self.address,
                "STARTTLS failed, continuing without TLS on a new connection"
            );
            drop(client);
            client = self.connect_and_greet().await?;
            self.hello(&mut client).await?;
        }

        Ok(client)
    }

    async fn connect_and_greet(&self) -> Result<SmtpClient, DeliveryError> {
        if self.accept_invalid_certs {
            tracing::warn!(
                server = %self.address,
                "TLS certificate validation is disabled for this connection"
            );
        }

        let mut client = SmtpClient::connect(
            &self.address,
            self.host.to_string(),
            Duration::from_secs(self.timeouts.connect_secs),
        )
        .await?
        .accept_invalid_certs(self.accept_invalid_certs);

        let greeting = self
            .timed(self.timeouts.greeting_secs, "greeting", client.read_greeting())
            .await?;
        self.expect(&greeting, "greeting", Response::is_success)?;

        Ok(client)
    }

    /// EHLO, falling back to HELO for servers that reject it.
    async fn hello(&self, client: &mut SmtpClient) -> Result<(), DeliveryError> {
        let ehlo = self
            .timed(self.timeouts.ehlo_secs, "EHLO", client.ehlo(self.helo_name))
            .await?;
        if ehlo.is_success() {
            return Ok(());
        }

        if ehlo.is_permanent_error() {
            tracing::debug!(server = %self.address, "EHLO rejected, trying HELO");
            let helo = self
                .timed(self.timeouts.ehlo_secs, "HELO", client.helo(self.helo_name))
                .await?;
            return self.expect(&helo, "HELO", Response::is_success);
        }

        self.expect(&ehlo, "EHLO", Response::is_success)
    }

    async fn negotiate_tls(&self, client: &mut SmtpClient) -> Result<TlsOutcome, DeliveryError> {
        if !self.starttls || !client.capabilities().starttls || client.is_tls() {
            return Ok(TlsOutcome::Skipped);
        }

        match self
            .timed(self.timeouts.starttls_secs, "STARTTLS", client.starttls())
            .await
        {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                tracing::info!(
                    server = %self.address,
                    response = %response.summary(),
                    "Server refused STARTTLS, continuing in plaintext"
                );
                return Ok(TlsOutcome::Skipped);
            }
            Err(err) => {
                tracing::info!(server = %self.address, %err, "STARTTLS handshake failed");
                return Ok(TlsOutcome::Reconnect);
            }
        }

        // Capabilities may change once encrypted.
        let ehlo = match self
            .timed(self.timeouts.ehlo_secs, "EHLO", client.ehlo(self.helo_name))
            .await
        {
            Ok(ehlo) => ehlo,
            Err(err) => {
                tracing::info!(server = %self.address, %err, "EHLO after STARTTLS failed");
                return Ok(TlsOutcome::Reconnect);
            }
        };
        self.expect(&ehlo, "EHLO", Response::is_success)?;

        tracing::debug!(server = %self.address, "TLS negotiated via STARTTLS");
        Ok(TlsOutcome::Upgraded)
    }

    /// AUTH with the first mechanism both sides support. Any refusal is an
    /// authentication failure, whatever the reply code.
    pub async fn authenticate(
        &self,
        client: &mut SmtpClient,
        username: &str,
        password: &str,
    ) -> Result<(), DeliveryError> {
        let limit = Duration::from_secs(self.timeouts.auth_secs);
        match tokio::time::timeout(limit, client.authenticate(username, password)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(ClientError::AuthenticationFailed { message, .. })) => {
                Err(DeliveryError::Authentication(message))
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(DeliveryError::Timeout(format!(
                "AUTH with {} after {limit:?}",
                self.address
            ))),
        }
    }

    pub async fn mail_from(
        &self,
        client: &mut SmtpClient,
        sender: &str,
        size: usize,
    ) -> Result<(), DeliveryError> {
        let response = self
            .timed(
                self.timeouts.mail_from_secs,
                "MAIL FROM",
                client.mail_from(sender, Some(size)),
            )
            .await?;
        self.expect(&response, "MAIL FROM", Response::is_success)
    }

    pub async fn rcpt_to(
        &self,
        client: &mut SmtpClient,
        recipient: &str,
    ) -> Result<(), DeliveryError> {
        let response = self
            .timed(self.timeouts.rcpt_to_secs, "RCPT TO", client.rcpt_to(recipient))
            .await?;
        self.expect(&response, "RCPT TO", Response::is_success)
    }

    /// DATA, the message itself, and the final reply.
    pub async fn data(&self, client: &mut SmtpClient, message: &[u8]) -> Result<(), DeliveryError> {
        let response = self
            .timed(self.timeouts.data_secs, "DATA", client.data())
            .await?;
        self.expect(&response, "DATA", |r: &Response| r.code == 354)?;

        let response = self
            .timed(
                self.timeouts.data_secs,
                "message transfer",
                client.send_message(message),
            )
            .await?;
        self.expect(&response, "end of data", Response::is_success)
    }

    /// Best effort; the outcome is already decided.
    pub async fn quit(&self, client: &mut SmtpClient) {
        if let Err(err) = self
            .timed(self.timeouts.quit_secs, "QUIT", client.quit())
            .await
        {
            tracing::debug!(server = %self.address, %err, "QUIT failed");
        }
    }
}
