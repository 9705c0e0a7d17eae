use core::fmt::{self, Display};

use crate::client::Response;

/// SASL mechanisms a server may list after `AUTH` in its EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
    Other(String),
}

impl From<&str> for AuthMechanism {
    fn from(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "PLAIN" => Self::Plain,
            "LOGIN" => Self::Login,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Display for AuthMechanism {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => fmt.write_str("PLAIN"),
            Self::Login => fmt.write_str("LOGIN"),
            Self::Other(name) => fmt.write_str(name),
        }
    }
}

/// Service extensions advertised in reply to EHLO.
///
/// The first reply line is the server's greeting domain and is skipped; each
/// following line names one extension with optional parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    pub auth: Vec<AuthMechanism>,
    /// `SIZE` limit in bytes; `Some(0)` means advertised without a limit.
    pub size: Option<usize>,
    pub pipelining: bool,
    pub eight_bit_mime: bool,
    pub smtputf8: bool,
}

impl Capabilities {
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let mut capabilities = Self::default();

        for line in response.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => capabilities.starttls = true,
                "PIPELINING" => capabilities.pipelining = true,
                "8BITMIME" => capabilities.eight_bit_mime = true,
                "SMTPUTF8" => capabilities.smtputf8 = true,
                "SIZE" => {
                    capabilities.size = Some(words.next().and_then(|s| s.parse().ok()).unwrap_or(0));
                }
                "AUTH" => capabilities.auth.extend(words.map(AuthMechanism::from)),
                _ => {}
            }
        }

        capabilities
    }

    #[must_use]
    pub fn supports_auth(&self, mechanism: &AuthMechanism) -> bool {
        self.auth.contains(mechanism)
    }

    /// Whether a message of `len` bytes fits the advertised SIZE limit.
    #[must_use]
    pub const fn accepts_size(&self, len: usize) -> bool {
        match self.size {
            Some(0) | None => true,
            Some(max) => len <= max,
        }
    }
}
