//! DKIM signing for submitted mail
//!
//! Turns an envelope into a signed message: identity lookup, key loading and
//! option building ahead of the DKIM engine.

mod key_store;
mod options;
mod pipeline;
mod resolver;

pub use key_store::{load_private_key, KeyStore, SigningKey};
pub use options::{HashAlgorithm, SigningOptions};
pub use pipeline::{SignOutcome, SigningPipeline};
pub use resolver::{Identity, IdentityResolver};
