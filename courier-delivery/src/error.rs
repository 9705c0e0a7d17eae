//! Error types for delivery attempts and queue operations.

use std::borrow::Cow;

use courier_common::address::AddressError;
use courier_dkim::DkimError;
use courier_queue::{QueueItemId, StoreError};
use courier_smtp::ClientError;
use thiserror::Error;

use crate::{
    DnsError,
    classifier::{ErrorType, FailureKind, classify},
};

/// Why one delivery attempt failed.
///
/// Every variant is turned into a [`crate::DeliveryResult`] at the worker
/// boundary; nothing here escapes a worker.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The server answered a command with a failure reply.
    #[error("{stage} rejected by {host}: {code} {message}")]
    Smtp {
        stage: &'static str,
        host: String,
        code: u16,
        message: String,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("DKIM signing failed: {0}")]
    Signing(#[from] DkimError),

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    /// Relay credentials were refused. Never retried.
    #[error("Relay authentication failed: {0}")]
    Authentication(String),

    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("Unable to read message: {0}")]
    MessageStore(String),

    #[error("No mail servers for {0}")]
    NoMailServers(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// The SMTP reply code behind this failure, if there was one.
    #[must_use]
    pub const fn smtp_code(&self) -> Option<u16> {
        match self {
            Self::Smtp { code, .. } => Some(*code),
            Self::Client(err) => err.code(),
            _ => None,
        }
    }

    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Smtp { .. } => FailureKind::Protocol,
            Self::Client(err) => match err {
                ClientError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                    FailureKind::Timeout
                }
                ClientError::Io(_) | ClientError::ConnectionClosed => FailureKind::Connection,
                ClientError::Timeout(_) => FailureKind::Timeout,
                ClientError::TlsError(_) => FailureKind::Tls,
                ClientError::AuthenticationFailed { .. } => FailureKind::Authentication,
                ClientError::ParseError(_)
                | ClientError::UnexpectedResponse { .. }
                | ClientError::SmtpError { .. }
                | ClientError::Utf8Error(_) => FailureKind::Protocol,
            },
            Self::Dns(err) if err.is_temporary() => FailureKind::DnsTemporary,
            Self::Dns(_) | Self::NoMailServers(_) => FailureKind::DnsPermanent,
            Self::Signing(_) => FailureKind::Signing,
            Self::InvalidAddress(_) => FailureKind::InvalidAddress,
            Self::Authentication(_) => FailureKind::Authentication,
            Self::MessageNotFound(_) => FailureKind::MessageMissing,
            Self::MessageStore(_) | Self::Internal(_) => FailureKind::Internal,
            Self::Timeout(_) => FailureKind::Timeout,
        }
    }

    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        // Credentials and keys do not fix themselves, whatever the reply code.
        match self {
            Self::Authentication(_) | Self::Signing(_) => ErrorType::AuthenticationFailed,
            _ => {
                let text = self.reply_text();
                classify(self.smtp_code(), Some(&*text), Some(self.failure_kind()))
            }
        }
    }

    /// Text scanned for keywords: the server's own words when it replied,
    /// so our description of the stage and host cannot match.
    fn reply_text(&self) -> Cow<'_, str> {
        match self {
            Self::Smtp { message, .. }
            | Self::Client(
                ClientError::SmtpError { message, .. }
                | ClientError::UnexpectedResponse { message, .. },
            ) => Cow::Borrowed(message),
            _ => Cow::Owned(self.to_string()),
        }
    }
}

/// Errors returned by the queue manager's API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue manager is already running")]
    AlreadyRunning,

    #[error("Queue manager is not running")]
    NotRunning,

    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue item {0} not found")]
    ItemNotFound(QueueItemId),

    /// The referenced message could not be loaded or has no recipients.
    #[error("Message error: {0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
