//! Header and body canonicalization (RFC 6376 section 3.4).

use std::fmt::{self, Display};

use serde::Deserialize;

use crate::message::HeaderField;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Canonicalization {
    Simple,
    #[default]
    Relaxed,
}

impl Canonicalization {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Relaxed => "relaxed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simple" => Some(Self::Simple),
            "relaxed" => Some(Self::Relaxed),
            _ => None,
        }
    }

    /// Parse the `c=` tag. A missing body part defaults to simple.
    pub fn parse_pair(value: &str) -> Option<(Self, Self)> {
        match value.split_once('/') {
            Some((header, body)) => Some((Self::parse(header)?, Self::parse(body)?)),
            None => Some((Self::parse(value)?, Self::Simple)),
        }
    }

    /// Canonical form of one header field, CRLF included.
    #[must_use]
    pub fn header(self, field: &HeaderField<'_>) -> String {
        let mut out = self.header_without_crlf(field.name, field.raw);
        out.push_str("\r\n");
        out
    }

    /// Canonical form of a raw `Name: value` field without the trailing CRLF,
    /// as used for the DKIM-Signature field itself.
    #[must_use]
    pub fn header_without_crlf(self, name: &str, raw: &str) -> String {
        match self {
            Self::Simple => raw.to_string(),
            Self::Relaxed => {
                let value = raw.split_once(':').map_or("", |(_, value)| value);
                format!(
                    "{}:{}",
                    name.trim().to_ascii_lowercase(),
                    relax_header_value(value)
                )
            }
        }
    }

    /// Canonical form of a CRLF body.
    #[must_use]
    pub fn body(self, body: &[u8]) -> Vec<u8> {
        let mut lines: Vec<&[u8]> = body.split(|&b| b == b'\n').collect();
        // `split` yields an empty tail after a final LF.
        if body.ends_with(b"\n") {
            lines.pop();
        }

        let lines: Vec<Vec<u8>> = lines
            .into_iter()
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                match self {
                    Self::Simple => line.to_vec(),
                    Self::Relaxed => relax_body_line(line),
                }
            })
            .collect();

        let kept = lines.iter().rposition(|l| !l.is_empty()).map_or(0, |i| i + 1);

        if kept == 0 {
            return match self {
                Self::Simple => b"\r\n".to_vec(),
                Self::Relaxed => Vec::new(),
            };
        }

        let mut out = Vec::with_capacity(body.len() + 2);
        for line in &lines[..kept] {
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unfold, collapse runs of whitespace to one space and trim both ends.
fn relax_header_value(value: &str) -> String {
    let unfolded = value.replace("\r\n", "");
    let mut out = String::with_capacity(unfolded.len());
    let mut pending_space = false;

    for c in unfolded.trim_matches([' ', '\t']).chars() {
        if c == ' ' || c == '\t' {
            pending_space = true;
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }

    out
}

/// Collapse whitespace runs and drop trailing whitespace.
fn relax_body_line(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len());
    let mut pending_space = false;

    for &b in line {
        if b == b' ' || b == b'\t' {
            pending_space = true;
        } else {
            if pending_space {
                out.push(b' ');
                pending_space = false;
            }
            out.push(b);
        }
    }

    out
}
