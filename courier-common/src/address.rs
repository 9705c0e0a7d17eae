//! Envelope address handling.
//!
//! Header values such as `"Jane" <jane@example.com>, bob@example.org` are
//! parsed with `mailparse`; the bare `local@domain` form is what travels in
//! the SMTP envelope and in queue records.

use std::fmt::{self, Display};

use mailparse::{MailAddr, addrparse};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Malformed address '{0}': {1}")]
    Malformed(String, String),

    #[error("Expected a single address but found {count} in '{input}'")]
    NotSingle { input: String, count: usize },
}

/// A single `local@domain` mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    local_part: String,
    domain: String,
}

impl Address {
    /// Parse exactly one mailbox, accepting either the bare form or a
    /// display-name form.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut list = Self::parse_list(trimmed)?;
        match list.len() {
            1 => Ok(list.remove(0)),
            count => Err(AddressError::NotSingle {
                input: trimmed.to_string(),
                count,
            }),
        }
    }

    /// Parse a header value holding any number of mailboxes and groups.
    pub fn parse_list(input: &str) -> Result<Vec<Self>, AddressError> {
        if input.trim().is_empty() {
            return Ok(Vec::new());
        }

        let parsed = addrparse(input)
            .map_err(|e| AddressError::Malformed(input.to_string(), e.to_string()))?;

        let mut addresses = Vec::new();
        for addr in parsed.iter() {
            match addr {
                MailAddr::Single(info) => addresses.push(Self::from_addr_spec(&info.addr)?),
                MailAddr::Group(group) => {
                    for info in &group.addrs {
                        addresses.push(Self::from_addr_spec(&info.addr)?);
                    }
                }
            }
        }

        Ok(addresses)
    }

    fn from_addr_spec(spec: &str) -> Result<Self, AddressError> {
        let malformed = |reason: &str| AddressError::Malformed(spec.to_string(), reason.to_string());

        let (local, domain) = spec.rsplit_once('@').ok_or_else(|| malformed("missing '@'"))?;

        if local.is_empty() {
            return Err(malformed("empty local part"));
        }
        if domain.is_empty() {
            return Err(malformed("empty domain"));
        }
        if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
            return Err(malformed("invalid domain"));
        }
        if spec.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(malformed("contains whitespace"));
        }

        Ok(Self {
            local_part: local.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    /// The domain, lowercased.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}
