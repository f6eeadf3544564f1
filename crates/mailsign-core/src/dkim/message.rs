//! Splitting a raw message into header fields and body
//!
//! Only CRLF is recognised as a line terminator. Header field values are kept
//! as the exact bytes following the colon, folding included, so that simple
//! canonicalization can reproduce them unchanged.

use mailsign_common::{Error, Result};

const CRLF: &[u8] = b"\r\n";

/// A header field as it appears in the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderField<'a> {
    raw_name: &'a str,
    /// Bytes after the colon up to, not including, the terminating CRLF
    pub value: &'a [u8],
}

impl<'a> HeaderField<'a> {
    /// Create a header field from a name and the bytes following its colon
    pub fn new(raw_name: &'a str, value: &'a [u8]) -> Self {
        Self { raw_name, value }
    }

    /// The field name without whitespace before the colon
    pub fn name(&self) -> &'a str {
        self.raw_name.trim_end_matches([' ', '\t'])
    }

    /// The field name exactly as written
    pub fn raw_name(&self) -> &'a str {
        self.raw_name
    }
}

/// A message split into its header fields and body
#[derive(Debug)]
pub struct ParsedMessage<'a> {
    pub headers: Vec<HeaderField<'a>>,
    pub body: &'a [u8],
}

/// Split `message` at the first empty line
///
/// A message without an empty line has no body.
fn split_message(message: &[u8]) -> (&[u8], &[u8]) {
    if message.starts_with(CRLF) {
        return (&[], &message[2..]);
    }

    match find(message, b"\r\n\r\n") {
        Some(i) => (&message[..i + 2], &message[i + 4..]),
        None => (message, &[]),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_wsp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Parse the header block and locate the body
pub fn parse_message(message: &[u8]) -> Result<ParsedMessage<'_>> {
    let (block, body) = split_message(message);

    // (name, value start, value end) as offsets into `block`
    let mut fields: Vec<(&str, usize, usize)> = Vec::new();
    let mut pos = 0;

    while pos < block.len() {
        let end = find(&block[pos..], CRLF).map_or(block.len(), |i| pos + i);
        let line = &block[pos..end];

        if line.first().copied().is_some_and(is_wsp) {
            // Folded continuation of the previous field
            match fields.last_mut() {
                Some(field) => field.2 = end,
                None => {
                    return Err(Error::Canonicalization(
                        "continuation line before the first header field".to_string(),
                    ))
                }
            }
        } else {
            let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
                Error::Canonicalization(format!(
                    "header line without colon: {:?}",
                    String::from_utf8_lossy(line)
                ))
            })?;

            let raw_name = &line[..colon];
            let name_len = raw_name.iter().rposition(|&b| !is_wsp(b)).map_or(0, |i| i + 1);
            if name_len == 0 || !raw_name[..name_len].iter().all(|b| (33..=126).contains(b)) {
                return Err(Error::Canonicalization(format!(
                    "invalid header field name: {:?}",
                    String::from_utf8_lossy(raw_name)
                )));
            }

            let raw_name = std::str::from_utf8(raw_name).map_err(|_| {
                Error::Canonicalization("header field name is not ASCII".to_string())
            })?;

            fields.push((raw_name, pos + colon + 1, end));
        }

        pos = end + CRLF.len();
    }

    let headers = fields
        .into_iter()
        .map(|(name, start, end)| HeaderField::new(name, &block[start..end]))
        .collect();

    Ok(ParsedMessage { headers, body })
}
