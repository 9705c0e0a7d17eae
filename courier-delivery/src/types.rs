//! Attempt outcomes and SMTP timeout configuration.

use std::{
    fmt::{self, Display},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    DeliveryError,
    classifier::{ErrorType, should_retry},
};

mod defaults {
    pub const fn command_secs() -> u64 {
        30
    }

    pub const fn data_secs() -> u64 {
        120
    }

    pub const fn quit_secs() -> u64 {
        10
    }
}

/// Per-operation timeouts for one SMTP conversation, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    #[serde(default = "defaults::command_secs")]
    pub connect_secs: u64,

    #[serde(default = "defaults::command_secs")]
    pub greeting_secs: u64,

    #[serde(default = "defaults::command_secs")]
    pub ehlo_secs: u64,

    #[serde(default = "defaults::command_secs")]
    pub starttls_secs: u64,

    #[serde(default = "defaults::command_secs")]
    pub auth_secs: u64,

    #[serde(default = "defaults::command_secs")]
    pub mail_from_secs: u64,

    #[serde(default = "defaults::command_secs")]
    pub rcpt_to_secs: u64,

    /// Covers both the DATA command and the message transfer.
    #[serde(default = "defaults::data_secs")]
    pub data_secs: u64,

    #[serde(default = "defaults::quit_secs")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::command_secs(),
            greeting_secs: defaults::command_secs(),
            ehlo_secs: defaults::command_secs(),
            starttls_secs: defaults::command_secs(),
            auth_secs: defaults::command_secs(),
            mail_from_secs: defaults::command_secs(),
            rcpt_to_secs: defaults::command_secs(),
            data_secs: defaults::data_secs(),
            quit_secs: defaults::quit_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Temporary failure; try again later.
    Deferred,
    /// Permanent failure.
    Bounced,
}

impl Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Delivered => "delivered",
            Self::Deferred => "deferred",
            Self::Bounced => "bounced",
        })
    }
}

/// The outcome of one delivery attempt for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub recipient: String,
    pub outcome: DeliveryOutcome,
    /// `None` exactly when delivered.
    pub error_type: Option<ErrorType>,
    pub smtp_code: Option<u16>,
    pub error: Option<String>,
    /// The host that produced the outcome.
    pub host: Option<String>,
    /// Every host contacted, in order.
    pub hosts_tried: Vec<String>,
    pub duration: Duration,
}

impl DeliveryResult {
    #[must_use]
    pub fn delivered(recipient: impl Into<String>, host: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            recipient: recipient.into(),
            outcome: DeliveryOutcome::Delivered,
            error_type: None,
            smtp_code: None,
            error: None,
            host: Some(host.clone()),
            hosts_tried: vec![host],
            duration: Duration::ZERO,
        }
    }

    /// A failed attempt, deferred or bounced according to its classification.
    #[must_use]
    pub fn failed(recipient: impl Into<String>, error: &DeliveryError, host: Option<String>) -> Self {
        let error_type = error.error_type();
        Self {
            recipient: recipient.into(),
            outcome: if should_retry(error_type) {
                DeliveryOutcome::Deferred
            } else {
                DeliveryOutcome::Bounced
            },
            error_type: Some(error_type),
            smtp_code: error.smtp_code(),
            error: Some(error.to_string()),
            hosts_tried: host.iter().cloned().collect(),
            host,
            duration: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered)
    }

    #[must_use]
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    #[must_use]
    pub fn with_hosts_tried(mut self, hosts: Vec<String>) -> Self {
        self.hosts_tried = hosts;
        self
    }

    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn timeout_defaults() {
        let timeouts: SmtpTimeouts = ron::from_str("(data_secs: 300)").unwrap();
        assert_eq!(timeouts.connect_secs, 30);
        assert_eq!(timeouts.data_secs, 300);
        assert_eq!(timeouts.quit_secs, 10);
        assert_eq!(SmtpTimeouts::default().data_secs, 120);
    }

    #[test]
    fn failures_follow_their_classification() {
        let temporary = DeliveryError::Smtp {
            stage: "MAIL FROM",
            host: "mx.example.com".into(),
            code: 421,
            message: "try later".into(),
        };
        let result = DeliveryResult::failed("a@example.com", &temporary, Some("mx".into()));
        assert_eq!(result.outcome, DeliveryOutcome::Deferred);
        assert_eq!(result.smtp_code, Some(421));
        assert_eq!(result.hosts_tried, vec!["mx".to_string()]);

        let permanent = DeliveryError::Smtp {
            stage: "RCPT TO",
            host: "mx.example.com".into(),
            code: 550,
            message: "no such user".into(),
        };
        let result = DeliveryResult::failed("a@example.com", &permanent, None);
        assert_eq!(result.outcome, DeliveryOutcome::Bounced);
        assert_eq!(result.error_type, Some(ErrorType::InvalidRecipient));
        assert!(!result.is_success());
    }
}
