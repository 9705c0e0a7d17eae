//! The `DKIM-Signature` tag list.

use std::fmt::{self, Display};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

use crate::{Canonicalization, DkimError, Result};

pub const HEADER_NAME: &str = "DKIM-Signature";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Algorithm {
    #[default]
    RsaSha256,
}

impl Algorithm {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rsa-sha256" => Ok(Self::RsaSha256),
            other => Err(DkimError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed or freshly computed signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimSignature {
    pub algorithm: Algorithm,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    /// `d=`
    pub domain: String,
    /// `s=`
    pub selector: String,
    /// `h=`, lowercased.
    pub signed_headers: Vec<String>,
    /// `bh=`, raw digest bytes.
    pub body_hash: Vec<u8>,
    /// `b=`, raw signature bytes. Empty while the signature is being computed.
    pub signature: Vec<u8>,
    /// `t=`
    pub timestamp: Option<u64>,
    /// `x=`
    pub expiration: Option<u64>,
    /// `l=`
    pub body_length: Option<usize>,
}

impl DkimSignature {
    /// The tag list with an empty `b=`, which is what gets hashed.
    #[must_use]
    pub fn unsigned_value(&self) -> String {
        let mut value = format!(
            "v=1; a={}; c={}/{}; d={}; s={};",
            self.algorithm,
            self.header_canonicalization,
            self.body_canonicalization,
            self.domain,
            self.selector
        );

        if let Some(timestamp) = self.timestamp {
            value.push_str(&format!(" t={timestamp};"));
        }
        if let Some(expiration) = self.expiration {
            value.push_str(&format!(" x={expiration};"));
        }
        if let Some(length) = self.body_length {
            value.push_str(&format!(" l={length};"));
        }

        value.push_str(&format!(
            " h={}; bh={}; b=",
            self.signed_headers.join(":"),
            BASE64.encode(&self.body_hash)
        ));
        value
    }

    /// The complete tag list.
    #[must_use]
    pub fn value(&self) -> String {
        let mut value = self.unsigned_value();
        value.push_str(&BASE64.encode(&self.signature));
        value
    }

    /// `DKIM-Signature: ...` without a line terminator.
    #[must_use]
    pub fn header_line(&self) -> String {
        format!("{HEADER_NAME}: {}", self.value())
    }

    /// Parse a header value (everything after the colon).
    pub fn parse(value: &str) -> Result<Self> {
        let tags = parse_tag_list(value)?;
        let tag = |name: &str| {
            tags.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        let required = |name: &'static str| {
            tag(name).ok_or_else(|| DkimError::InvalidSignature(format!("missing {name}= tag")))
        };

        if required("v")? != "1" {
            return Err(DkimError::InvalidSignature(format!(
                "unsupported version {}",
                required("v")?
            )));
        }

        let (header_canonicalization, body_canonicalization) = match tag("c") {
            Some(c) => Canonicalization::parse_pair(c)
                .ok_or_else(|| DkimError::InvalidSignature(format!("bad c= tag {c}")))?,
            None => (Canonicalization::Simple, Canonicalization::Simple),
        };

        let signed_headers: Vec<String> = required("h")?
            .split(':')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(DkimError::InvalidSignature(
                "From is not among the signed headers".to_string(),
            ));
        }

        let decode = |name: &'static str| {
            let raw: String = required(name)?
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            BASE64
                .decode(raw)
                .map_err(|e| DkimError::InvalidSignature(format!("{name}= is not base64: {e}")))
        };

        let number = |name: &'static str| -> Result<Option<u64>> {
            tag(name)
                .map(|v| {
                    v.parse::<u64>().map_err(|_| {
                        DkimError::InvalidSignature(format!("{name}= is not a number: {v}"))
                    })
                })
                .transpose()
        };

        let domain = required("d")?.to_ascii_lowercase();
        let selector = required("s")?.to_string();
        if domain.is_empty() || selector.is_empty() {
            return Err(DkimError::InvalidSignature(
                "empty d= or s= tag".to_string(),
            ));
        }

        Ok(Self {
            algorithm: Algorithm::parse(required("a")?)?,
            header_canonicalization,
            body_canonicalization,
            domain,
            selector,
            signed_headers,
            body_hash: decode("bh")?,
            signature: decode("b")?,
            timestamp: number("t")?,
            expiration: number("x")?,
            body_length: number("l")?
                .map(usize::try_from)
                .transpose()
                .map_err(|_| DkimError::InvalidSignature("l= out of range".to_string()))?,
        })
    }

    /// DNS name of the key record: `{selector}._domainkey.{domain}`.
    #[must_use]
    pub fn key_record_name(&self) -> String {
        format!("{}._domainkey.{}", self.selector, self.domain)
    }
}

/// Parse `tag=value; tag=value` into (lowercased name, trimmed value) pairs.
pub(crate) fn parse_tag_list(value: &str) -> Result<Vec<(String, String)>> {
    let mut tags: Vec<(String, String)> = Vec::new();

    for part in value.split(';') {
        if part.trim().is_empty() {
            continue;
        }

        let (name, tag_value) = part
            .split_once('=')
            .ok_or_else(|| DkimError::InvalidSignature(format!("tag without '=': {part:?}")))?;
        let name = name.trim().to_ascii_lowercase();

        if tags.iter().any(|(n, _)| *n == name) {
            return Err(DkimError::InvalidSignature(format!("duplicate {name}= tag")));
        }

        let tag_value: String = tag_value.replace("\r\n", "");
        tags.push((name, tag_value.trim().to_string()));
    }

    Ok(tags)
}

/// Remove the value of the `b=` tag from a raw header field, leaving every
/// other byte (folding included) untouched.
#[must_use]
pub fn strip_signature_value(raw: &str) -> String {
    let Some((head, value)) = raw.split_once(':') else {
        return raw.to_string();
    };

    let parts: Vec<String> = value
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((name, _)) if name.trim().eq_ignore_ascii_case("b") => format!("{name}="),
            _ => part.to_string(),
        })
        .collect();

    format!("{head}:{}", parts.join(";"))
}
