//! Composed messages waiting for delivery.
//!
//! The queue only stores message ids; workers load the message itself
//! through a [`MessageStore`] on every attempt.

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use mailparse::{MailAddr, MailHeader};
use serde::Deserialize;
use thiserror::Error;

use crate::DeliveryError;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message {0} not found")]
    NotFound(String),

    #[error("Invalid message id '{0}'")]
    InvalidId(String),

    #[error("Unable to parse message: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<mailparse::MailParseError> for MessageError {
    fn from(err: mailparse::MailParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<MessageError> for DeliveryError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::NotFound(id) => Self::MessageNotFound(id),
            other => Self::MessageStore(other.to_string()),
        }
    }
}

/// A composed RFC 5322 message and its envelope, as read from its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    /// Address from the `From` header; the envelope sender.
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Every header field as `(name, value)`, in order.
    pub headers: Vec<(String, String)>,
    /// The message as transmitted, without any `Bcc` field.
    pub raw: Vec<u8>,
}

impl StoredMessage {
    /// Parse `raw` and drop its `Bcc` field from what will be transmitted.
    pub fn parse(id: impl Into<String>, raw: &[u8]) -> Result<Self, MessageError> {
        let (fields, _) = mailparse::parse_headers(raw)?;

        let mut message = Self {
            id: id.into(),
            from: String::new(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            headers: Vec::with_capacity(fields.len()),
            raw: strip_header(raw, "bcc"),
        };

        for field in &fields {
            let name = field.get_key();
            match name.to_ascii_lowercase().as_str() {
                "from" => {
                    message.from = addresses(field)?.into_iter().next().unwrap_or_default();
                }
                "to" => message.to.extend(addresses(field)?),
                "cc" => message.cc.extend(addresses(field)?),
                "bcc" => message.bcc.extend(addresses(field)?),
                _ => {}
            }
            message.headers.push((name, field.get_value()));
        }

        Ok(message)
    }

    /// Every distinct envelope recipient: To, then Cc, then Bcc.
    /// Duplicates are compared case-insensitively.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .filter(|rcpt| seen.insert(rcpt.to_ascii_lowercase()))
            .cloned()
            .collect()
    }

    /// First value of header `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

fn addresses(field: &MailHeader<'_>) -> Result<Vec<String>, MessageError> {
    Ok(mailparse::addrparse_header(field)?
        .iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(single) => vec![single.addr.clone()],
            MailAddr::Group(group) => group.addrs.iter().map(|s| s.addr.clone()).collect(),
        })
        .collect())
}

/// `raw` without any field called `name` in its header section, folded
/// continuation lines included.
fn strip_header(raw: &[u8], name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut skipping = false;
    let mut rest = raw;

    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map_or(rest.len(), |i| i + 1);
        let (line, tail) = rest.split_at(end);

        if line == b"\r\n" || line == b"\n" {
            out.extend_from_slice(rest);
            return out;
        }

        let continuation = line.first().is_some_and(|b| *b == b' ' || *b == b'\t');
        if !continuation {
            skipping = line
                .iter()
                .position(|&b| b == b':')
                .is_some_and(|colon| line[..colon].trim_ascii().eq_ignore_ascii_case(name.as_bytes()));
        }
        if !skipping {
            out.extend_from_slice(line);
        }
        rest = tail;
    }

    out
}

/// Message ids become file names: no separators, no leading dot.
fn validate_id(id: &str) -> Result<(), MessageError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));

    if valid {
        Ok(())
    } else {
        Err(MessageError::InvalidId(id.to_string()))
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn get_message(&self, id: &str) -> Result<StoredMessage, MessageError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMessageStore {
    messages: Arc<DashMap<String, StoredMessage>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: &str, raw: &[u8]) -> Result<StoredMessage, MessageError> {
        validate_id(id)?;
        let message = StoredMessage::parse(id, raw)?;
        self.messages.insert(id.to_string(), message.clone());
        Ok(message)
    }

    #[must_use]
    pub fn remove(&self, id: &str) -> Option<StoredMessage> {
        self.messages.remove(id).map(|(_, message)| message)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get_message(&self, id: &str) -> Result<StoredMessage, MessageError> {
        self.messages
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MessageError::NotFound(id.to_string()))
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn path() -> PathBuf {
        PathBuf::from("/var/spool/courier/messages")
    }
}

/// One `<id>.eml` file per message.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMessageStore {
    #[serde(default = "defaults::path")]
    path: PathBuf,
}

impl Default for FileMessageStore {
    fn default() -> Self {
        Self {
            path: defaults::path(),
        }
    }
}

impl FileMessageStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn message_path(&self, id: &str) -> PathBuf {
        self.path.join(format!("{id}.eml"))
    }

    /// Store `raw` under `id`, replacing any previous message. The write is
    /// atomic: readers see the old file or the new one.
    pub async fn put(&self, id: &str, raw: &[u8]) -> Result<StoredMessage, MessageError> {
        validate_id(id)?;
        let message = StoredMessage::parse(id, raw)?;

        tokio::fs::create_dir_all(&self.path).await?;
        let tmp = self.path.join(format!(".tmp_{id}.eml"));
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, self.message_path(id)).await?;

        Ok(message)
    }

    pub async fn remove(&self, id: &str) -> Result<bool, MessageError> {
        validate_id(id)?;
        match tokio::fs::remove_file(self.message_path(id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn get_message(&self, id: &str) -> Result<StoredMessage, MessageError> {
        validate_id(id)?;
        match tokio::fs::read(self.message_path(id)).await {
            Ok(raw) => StoredMessage::parse(id, &raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(MessageError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}
