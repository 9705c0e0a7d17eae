//! Splitting a raw message into header fields and body.

use std::borrow::Cow;

/// One header field exactly as it appears in the message, folding included,
/// without the final CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField<'a> {
    pub name: &'a str,
    pub raw: &'a str,
}

impl HeaderField<'_> {
    /// Everything after the first colon.
    #[must_use]
    pub fn value(&self) -> &str {
        self.raw
            .split_once(':')
            .map_or("", |(_, value)| value)
    }

    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Convert bare LF line endings to CRLF, borrowing when nothing changes.
#[must_use]
pub fn normalize_line_endings(input: &[u8]) -> Cow<'_, [u8]> {
    let needs_fix = input
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b'\n' && (i == 0 || input[i - 1] != b'\r'));

    if !needs_fix {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len() + input.len() / 32);
    let mut previous = 0u8;
    for &byte in input {
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        previous = byte;
    }
    Cow::Owned(out)
}

/// A message with CRLF line endings split at the first empty line.
#[derive(Debug)]
pub struct ParsedMessage<'a> {
    pub headers: Vec<HeaderField<'a>>,
    pub body: &'a [u8],
}

impl<'a> ParsedMessage<'a> {
    /// Parse a message that already uses CRLF line endings (see
    /// [`normalize_line_endings`]).
    ///
    /// A message without an empty line is all headers and an empty body.
    pub fn parse(message: &'a [u8]) -> crate::Result<Self> {
        let (header_block, body) = if message.starts_with(b"\r\n") {
            (&message[..0], &message[2..])
        } else {
            match find(message, b"\r\n\r\n") {
                Some(pos) => (&message[..pos + 2], &message[pos + 4..]),
                None => (message, &message[message.len()..]),
            }
        };

        let header_block = std::str::from_utf8(header_block).map_err(|e| {
            crate::DkimError::MalformedMessage(format!("header block is not UTF-8: {e}"))
        })?;

        Ok(Self {
            headers: split_headers(header_block)?,
            body,
        })
    }

    /// All fields called `name`, in message order.
    pub fn fields<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s HeaderField<'a>> + 's {
        self.headers.iter().filter(move |h| h.is(name))
    }

    /// Pick the fields listed in `names` as RFC 6376 section 5.4.2
    /// describes: repeated names consume instances from the bottom up and
    /// names with no remaining instance contribute nothing.
    #[must_use]
    pub fn select(&self, names: &[String]) -> Vec<&HeaderField<'a>> {
        let mut used: Vec<(String, usize)> = Vec::new();
        let mut selected = Vec::new();

        for name in names {
            let lower = name.to_ascii_lowercase();
            let skip = match used.iter_mut().find(|(n, _)| *n == lower) {
                Some((_, count)) => {
                    *count += 1;
                    *count - 1
                }
                None => {
                    used.push((lower.clone(), 1));
                    0
                }
            };

            if let Some(field) = self.headers.iter().rev().filter(|h| h.is(&lower)).nth(skip) {
                selected.push(field);
            }
        }

        selected
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_headers(block: &str) -> crate::Result<Vec<HeaderField<'_>>> {
    let mut fields = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in block.split_inclusive("\r\n") {
        let is_continuation = line.starts_with([' ', '\t']);
        if !is_continuation {
            if let Some(begin) = start {
                fields.push(make_field(&block[begin..offset])?);
            }
            start = Some(offset);
        } else if start.is_none() {
            return Err(crate::DkimError::MalformedMessage(
                "message starts with a folded header line".to_string(),
            ));
        }
        offset += line.len();
    }

    if let Some(begin) = start {
        fields.push(make_field(&block[begin..offset])?);
    }

    Ok(fields)
}

fn make_field(raw: &str) -> crate::Result<HeaderField<'_>> {
    let raw = raw.strip_suffix("\r\n").unwrap_or(raw);
    let (name, _) = raw.split_once(':').ok_or_else(|| {
        crate::DkimError::MalformedMessage(format!("header line without a colon: {raw:?}"))
    })?;

    Ok(HeaderField {
        name: name.trim_end(),
        raw,
    })
}
