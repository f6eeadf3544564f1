//! Error types for mailsign

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mailsign
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read private key {}: {source}", path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid private key {}: {reason}", path.display())]
    KeyFormat { path: PathBuf, reason: String },

    #[error("Unable to load private key for {domain}: {source}")]
    KeyLoad {
        domain: String,
        #[source]
        source: Box<Error>,
    },

    #[error("No signing identity configured for {0}")]
    UnknownIdentity(String),

    #[error("Invalid virtual host {domain}: no {field} specified")]
    InvalidIdentityConfig { domain: String, field: &'static str },

    #[error("Cannot extract a sending domain from {0:?}")]
    MalformedSender(String),

    #[error("Canonicalization error: {0}")]
    Canonicalization(String),

    #[error("Message exceeds the maximum size of {limit} bytes")]
    MessageTooLarge { limit: usize },

    #[error("Too many recipients (maximum {limit})")]
    TooManyRecipients { limit: usize },

    #[error("Invalid sender address: {0}")]
    InvalidSender(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailsign
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the SMTP reply code and enhanced status text for this error
    pub fn smtp_reply(&self) -> (u16, &'static str) {
        match self {
            Error::Config(_) => (451, "4.3.5 Server configuration problem"),
            Error::KeyRead { .. } | Error::KeyFormat { .. } | Error::KeyLoad { .. } => {
                (451, "4.7.0 Unable to sign message, try again later")
            }
            Error::UnknownIdentity(_) => (550, "5.7.1 Sender domain not permitted to submit"),
            Error::InvalidIdentityConfig { .. } => (451, "4.3.5 Signing identity misconfigured"),
            Error::MalformedSender(_) => (550, "5.1.7 Sender address has no usable domain"),
            Error::Canonicalization(_) => (554, "5.6.0 Message cannot be signed"),
            Error::MessageTooLarge { .. } => (552, "5.3.4 Message size exceeds fixed limit"),
            Error::TooManyRecipients { .. } => (452, "4.5.3 Too many recipients"),
            Error::InvalidSender(_) => (501, "5.1.7 Bad sender address syntax"),
            Error::InvalidRecipient(_) => (501, "5.1.3 Bad recipient address syntax"),
            Error::Relay(_) => (451, "4.4.0 Relay to next hop failed"),
            Error::Io(_) | Error::Other(_) => (451, "4.3.0 Temporary error"),
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::KeyRead { .. } => "KEY_READ_ERROR",
            Error::KeyFormat { .. } => "KEY_FORMAT_ERROR",
            Error::KeyLoad { .. } => "KEY_LOAD_ERROR",
            Error::UnknownIdentity(_) => "UNKNOWN_IDENTITY",
            Error::InvalidIdentityConfig { .. } => "INVALID_IDENTITY_CONFIG",
            Error::MalformedSender(_) => "MALFORMED_SENDER",
            Error::Canonicalization(_) => "CANONICALIZATION_ERROR",
            Error::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            Error::TooManyRecipients { .. } => "TOO_MANY_RECIPIENTS",
            Error::InvalidSender(_) => "INVALID_SENDER",
            Error::InvalidRecipient(_) => "INVALID_RECIPIENT",
            Error::Relay(_) => "RELAY_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error means no signing identity could be resolved for the
    /// sender, which is subject to the unresolved-domain policy
    pub fn is_unresolved_sender(&self) -> bool {
        matches!(self, Error::UnknownIdentity(_) | Error::MalformedSender(_))
    }
}
