//! DKIM signing (RFC 6376)
//!
//! Produces the value of a `DKIM-Signature` header field for a message and a
//! set of [`SigningOptions`]. Only signing is implemented; verification is the
//! receiver's business.

mod canonicalize;
mod message;

pub use canonicalize::{canonicalize_body, canonicalize_header};
pub use message::{parse_message, HeaderField, ParsedMessage};

use crate::signing::SigningOptions;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailsign_common::config::Canonicalization;
use mailsign_common::{Error, Result};
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Name of the header field carrying the signature
pub const DKIM_SIGNATURE: &str = "DKIM-Signature";

/// Width of one line of the folded b= value
const SIGNATURE_LINE_WIDTH: usize = 72;

/// A DKIM engine
///
/// Implementations return the header field value (everything after
/// `DKIM-Signature:`) or an error if the message cannot be canonicalized or
/// hashed.
pub trait MessageSigner: Send + Sync {
    fn sign(&self, message: &[u8], options: &SigningOptions) -> Result<String>;
}

/// RSA-SHA256 DKIM signer
#[derive(Debug, Clone, Default)]
pub struct DkimSigner {
    fixed_timestamp: Option<i64>,
}

impl DkimSigner {
    /// Create a signer stamping signatures with the current time
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signer that always uses `timestamp` for the t= tag
    pub fn with_timestamp(timestamp: i64) -> Self {
        Self {
            fixed_timestamp: Some(timestamp),
        }
    }

    fn timestamp(&self) -> i64 {
        self.fixed_timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp())
    }
}

impl MessageSigner for DkimSigner {
    fn sign(&self, message: &[u8], options: &SigningOptions) -> Result<String> {
        let parsed = parse_message(message)?;

        let signed = select_headers(&parsed.headers, &options.header_keys);
        if !signed.iter().any(|h| h.name().eq_ignore_ascii_case("from")) {
            return Err(Error::Canonicalization(
                "message has no From header field".to_string(),
            ));
        }

        let canon_body = canonicalize_body(options.body_canonicalization, parsed.body);
        let body_hash = BASE64.encode(Sha256::digest(&canon_body));

        let header_list = signed
            .iter()
            .map(|h| h.name().to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(":");

        let mut value = format!(
            "v=1; a=rsa-{}; d={}; s={}; c={}/{};\r\n\tt={}; h={};\r\n\tbh={};\r\n\tb=",
            options.hash.dkim_name(),
            options.domain,
            options.selector,
            options.header_canonicalization,
            options.body_canonicalization,
            self.timestamp(),
            header_list,
            body_hash,
        );

        let data = signing_input(options.header_canonicalization, &signed, &value);

        let signature = options
            .key
            .try_sign(&data)
            .map_err(|e| Error::Canonicalization(format!("RSA signing failed: {}", e)))?;

        value.push_str(&fold_signature(&BASE64.encode(signature.to_bytes())));

        debug!(
            "Signed message for d={} s={} h={}",
            options.domain, options.selector, header_list
        );

        Ok(value)
    }
}

/// Pick the header fields to sign, in the order of `keys`
///
/// Each occurrence of a name in `keys` takes the next instance of that field
/// counting from the bottom of the header block. Names without a remaining
/// instance are skipped.
pub fn select_headers<'a>(
    headers: &[HeaderField<'a>],
    keys: &[String],
) -> Vec<HeaderField<'a>> {
    let mut used = vec![false; headers.len()];
    let mut selected = Vec::with_capacity(keys.len());

    for key in keys {
        let found = headers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, h)| !used[*i] && h.name().eq_ignore_ascii_case(key));

        if let Some((i, header)) = found {
            used[i] = true;
            selected.push(*header);
        }
    }

    selected
}

/// The bytes covered by the signature: the selected header fields followed by
/// the signature field itself with an empty b= and no trailing CRLF
fn signing_input(canon: Canonicalization, signed: &[HeaderField<'_>], value: &str) -> Vec<u8> {
    let mut data = Vec::new();

    for header in signed {
        canonicalize_header(&mut data, canon, header);
        data.extend_from_slice(b"\r\n");
    }

    let raw_value = format!(" {}", value);
    let field = HeaderField::new(DKIM_SIGNATURE, raw_value.as_bytes());
    canonicalize_header(&mut data, canon, &field);

    data
}

fn fold_signature(b64: &str) -> String {
    b64.as_bytes()
        .chunks(SIGNATURE_LINE_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("\r\n\t")
}

/// Prepend a signature header field to a message
///
/// The original bytes, body included, are kept as they are.
pub fn prepend_signature(value: &str, message: &[u8]) -> Vec<u8> {
    let mut signed = Vec::with_capacity(DKIM_SIGNATURE.len() + value.len() + message.len() + 4);
    signed.extend_from_slice(DKIM_SIGNATURE.as_bytes());
    signed.extend_from_slice(b": ");
    signed.extend_from_slice(value.as_bytes());
    signed.extend_from_slice(b"\r\n");
    signed.extend_from_slice(message);
    signed
}
