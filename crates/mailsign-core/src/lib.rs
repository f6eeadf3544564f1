//! mailsign Core - DKIM signing and SMTP submission
//!
//! This crate provides the signing pipeline (key store, identity resolution,
//! option building and the DKIM engine), the SMTP session front end and the
//! relay to the next hop.

pub mod dkim;
pub mod relay;
pub mod reload;
pub mod signing;
pub mod smtp;

#[cfg(test)]
mod testing;

pub use dkim::{DkimSigner, MessageSigner};
pub use relay::{Relay, SmtpRelay};
pub use reload::{ConfigHandle, Snapshot};
pub use signing::{KeyStore, SignOutcome, SigningPipeline};
pub use smtp::SmtpServer;
