//! Signing options handed to the DKIM engine

use super::key_store::{KeyStore, SigningKey};
use super::resolver::Identity;
use mailsign_common::config::Canonicalization;
use mailsign_common::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Digest used for the signature and the body hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
}

impl HashAlgorithm {
    /// Name used in the a= tag
    pub fn dkim_name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

/// One message's signing parameters
#[derive(Clone)]
pub struct SigningOptions {
    pub domain: String,
    pub selector: String,
    pub key: Arc<SigningKey>,
    pub hash: HashAlgorithm,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    pub header_keys: Vec<String>,
}

impl fmt::Debug for SigningOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningOptions")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .field("key", &"<redacted>")
            .field("hash", &self.hash)
            .field("header_canonicalization", &self.header_canonicalization)
            .field("body_canonicalization", &self.body_canonicalization)
            .field("header_keys", &self.header_keys)
            .finish()
    }
}

impl SigningOptions {
    /// Build options for `identity`, loading its key through `key_store`
    pub async fn build(identity: Identity, key_store: &KeyStore) -> Result<Self> {
        let key = key_store
            .get(&identity.private_key_path)
            .await
            .map_err(|e| Error::KeyLoad {
                domain: identity.domain.clone(),
                source: Box::new(e),
            })?;

        Ok(Self {
            domain: identity.domain,
            selector: identity.selector,
            key,
            hash: HashAlgorithm::Sha256,
            header_canonicalization: identity.header_canonicalization,
            body_canonicalization: identity.body_canonicalization,
            header_keys: identity.header_keys,
        })
    }
}
