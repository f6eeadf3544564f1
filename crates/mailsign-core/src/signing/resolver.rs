//! Mapping a sending domain to its signing identity

use mailsign_common::config::{Canonicalization, SigningConfig};
use mailsign_common::{Error, Result};
use std::path::PathBuf;

/// Everything needed to sign for one tenant, except the loaded key
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    /// d= tag
    pub domain: String,
    /// s= tag
    pub selector: String,
    pub private_key_path: PathBuf,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    /// Effective header keys; the global list when the tenant has none
    pub header_keys: Vec<String>,
}

/// Looks up identities in one configuration snapshot
pub struct IdentityResolver<'a> {
    config: &'a SigningConfig,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(config: &'a SigningConfig) -> Self {
        Self { config }
    }

    /// Resolve the identity for `sending_domain`
    ///
    /// The lookup is an exact, case-insensitive match; a subdomain does not
    /// inherit its parent's identity.
    pub fn resolve(&self, sending_domain: &str) -> Result<Identity> {
        let key = sending_domain.trim_end_matches('.').to_ascii_lowercase();

        let vhost = self
            .config
            .virtual_hosts
            .get(&key)
            .ok_or_else(|| Error::UnknownIdentity(sending_domain.to_string()))?;

        vhost.validate()?;

        Ok(Identity {
            domain: vhost.domain.clone(),
            selector: vhost.selector.clone(),
            private_key_path: vhost.private_key_path.clone(),
            header_canonicalization: vhost.header_canonicalization,
            body_canonicalization: vhost.body_canonicalization,
            header_keys: vhost.header_keys_or(&self.config.header_keys).to_vec(),
        })
    }
}
