//! Failure classification.
//!
//! [`classify`] labels a failed attempt from up to three signals, most
//! authoritative first: the SMTP reply code, the kind of failure the client
//! observed, and finally a keyword scan of the error text. Whatever cannot be
//! classified is [`ErrorType::Unknown`], which is retried.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Temporary,
    Permanent,
    ConnectionFailed,
    RateLimited,
    Timeout,
    DnsTemporary,
    InvalidRecipient,
    Rejected,
    PolicyViolation,
    DnsPermanent,
    AuthenticationFailed,
    Unknown,
}

impl ErrorType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
            Self::ConnectionFailed => "connection_failed",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::DnsTemporary => "dns_temporary",
            Self::InvalidRecipient => "invalid_recipient",
            Self::Rejected => "rejected",
            Self::PolicyViolation => "policy_violation",
            Self::DnsPermanent => "dns_permanent",
            Self::AuthenticationFailed => "authentication_failed",
            Self::Unknown => "unknown",
        }
    }

    /// Members of the permanent family never succeed on retry.
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::Permanent
                | Self::InvalidRecipient
                | Self::Rejected
                | Self::PolicyViolation
                | Self::DnsPermanent
                | Self::AuthenticationFailed
        )
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure of this type is worth another attempt.
#[must_use]
pub const fn should_retry(error_type: ErrorType) -> bool {
    !error_type.is_permanent()
}

/// What went wrong, independent of any reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Refused, reset, unreachable, closed mid-conversation.
    Connection,
    Timeout,
    /// STARTTLS handshake failure.
    Tls,
    DnsPermanent,
    DnsTemporary,
    /// Address rejected before any network activity.
    InvalidAddress,
    Authentication,
    /// DKIM signing failed; a bad key fails the same way every time.
    Signing,
    /// The composed message is gone from the message store.
    MessageMissing,
    /// Malformed or unexpected replies.
    Protocol,
    Internal,
}

impl FailureKind {
    const fn error_type(self) -> Option<ErrorType> {
        match self {
            Self::Connection | Self::Tls => Some(ErrorType::ConnectionFailed),
            Self::Timeout => Some(ErrorType::Timeout),
            Self::DnsPermanent => Some(ErrorType::DnsPermanent),
            Self::DnsTemporary => Some(ErrorType::DnsTemporary),
            Self::InvalidAddress => Some(ErrorType::InvalidRecipient),
            Self::Authentication | Self::Signing => Some(ErrorType::AuthenticationFailed),
            Self::MessageMissing => Some(ErrorType::Permanent),
            Self::Protocol | Self::Internal => None,
        }
    }
}

const RATE_LIMIT_WORDS: &[&str] = &["rate limit", "too many", "throttl", "slow down"];
const POLICY_WORDS: &[&str] = &[
    "spam",
    "blocked",
    "blacklist",
    "blocklist",
    "policy",
    "dmarc",
    "spf",
    "reputation",
];

/// Keyword table scanned in order; the first hit wins.
const KEYWORDS: &[(&[&str], ErrorType)] = &[
    (RATE_LIMIT_WORDS, ErrorType::RateLimited),
    (&["timed out", "timeout"], ErrorType::Timeout),
    (
        &[
            "nxdomain",
            "domain does not exist",
            "no such domain",
            "does not accept mail",
        ],
        ErrorType::DnsPermanent,
    ),
    (
        &["servfail", "name resolution", "dns"],
        ErrorType::DnsTemporary,
    ),
    (
        &[
            "connection refused",
            "connection reset",
            "unreachable",
            "could not connect",
            "broken pipe",
            "connection closed",
        ],
        ErrorType::ConnectionFailed,
    ),
    (
        &[
            "user unknown",
            "no such user",
            "unknown user",
            "mailbox unavailable",
            "mailbox not found",
            "recipient rejected",
            "invalid recipient",
            "address rejected",
        ],
        ErrorType::InvalidRecipient,
    ),
    (
        &["authentication", "credentials", "auth failed"],
        ErrorType::AuthenticationFailed,
    ),
    (POLICY_WORDS, ErrorType::PolicyViolation),
    (
        &["try again", "temporar", "greylist", "busy", "later"],
        ErrorType::Temporary,
    ),
    (&["rejected", "denied", "refused"], ErrorType::Rejected),
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Classify from the reply code, refined within its family by the text.
fn classify_code(code: u16, text: &str) -> Option<ErrorType> {
    match code {
        400..=499 => Some(if contains_any(text, RATE_LIMIT_WORDS) {
            ErrorType::RateLimited
        } else {
            ErrorType::Temporary
        }),
        550 | 551 | 553 | 556 => Some(ErrorType::InvalidRecipient),
        530 | 534 | 535 | 538 => Some(ErrorType::AuthenticationFailed),
        500..=599 => Some(if text.contains("5.7.") || contains_any(text, POLICY_WORDS) {
            ErrorType::PolicyViolation
        } else if code == 554 {
            ErrorType::Rejected
        } else {
            ErrorType::Permanent
        }),
        _ => None,
    }
}

/// Label one failed attempt.
///
/// Precedence: SMTP code, then failure kind, then keywords in `message`.
#[must_use]
pub fn classify(
    smtp_code: Option<u16>,
    message: Option<&str>,
    failure: Option<FailureKind>,
) -> ErrorType {
    let text = message.unwrap_or_default().to_ascii_lowercase();

    smtp_code
        .and_then(|code| classify_code(code, &text))
        .or_else(|| failure.and_then(FailureKind::error_type))
        .or_else(|| {
            KEYWORDS
                .iter()
                .find(|(words, _)| contains_any(&text, words))
                .map(|(_, error_type)| *error_type)
        })
        .unwrap_or(ErrorType::Unknown)
}
