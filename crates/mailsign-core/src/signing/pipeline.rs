//! Signing pipeline
//!
//! Takes a complete envelope, works out the sending domain, resolves its
//! identity, builds the signing options and prepends a `DKIM-Signature`
//! header to the message.

use super::options::SigningOptions;
use super::resolver::IdentityResolver;
use crate::dkim::{prepend_signature, DkimSigner, MessageSigner};
use crate::reload::ConfigHandle;
use mailsign_common::config::UnresolvedDomainPolicy;
use mailsign_common::types::Envelope;
use mailsign_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of running a message through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    /// The message now starts with a DKIM-Signature header
    Signed {
        message: Vec<u8>,
        domain: String,
        selector: String,
    },
    /// No identity applied and the policy allows unsigned relay
    Unsigned { message: Vec<u8> },
}

impl SignOutcome {
    /// The bytes to relay
    pub fn message(&self) -> &[u8] {
        match self {
            SignOutcome::Signed { message, .. } | SignOutcome::Unsigned { message } => message,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, SignOutcome::Signed { .. })
    }
}

/// Signs complete messages
pub struct SigningPipeline {
    config: Arc<ConfigHandle>,
    signer: Arc<dyn MessageSigner>,
}

impl SigningPipeline {
    /// Create a pipeline using the built-in DKIM engine
    pub fn new(config: Arc<ConfigHandle>) -> Self {
        Self::with_signer(config, Arc::new(DkimSigner::new()))
    }

    /// Create a pipeline with a custom engine
    pub fn with_signer(config: Arc<ConfigHandle>, signer: Arc<dyn MessageSigner>) -> Self {
        Self { config, signer }
    }

    /// Sign `envelope.data`
    ///
    /// Every envelope ends in exactly one of three ways: a signed message, an
    /// unsigned message allowed by the unresolved-domain policy, or an error.
    /// The identity and its key come from one configuration snapshot even if
    /// a reload happens while the key is loading.
    pub async fn sign(&self, envelope: &Envelope) -> Result<SignOutcome> {
        let snapshot = self.config.snapshot();
        let signing = &snapshot.config.signing;

        let identity = match sending_domain(envelope)
            .and_then(|domain| IdentityResolver::new(signing).resolve(domain))
        {
            Ok(identity) => identity,
            Err(e) if e.is_unresolved_sender() => {
                return match signing.unresolved_domain {
                    UnresolvedDomainPolicy::Reject => {
                        info!("Rejecting message: {}", e);
                        Err(e)
                    }
                    UnresolvedDomainPolicy::RelayUnsigned => {
                        warn!("Relaying message unsigned: {}", e);
                        Ok(SignOutcome::Unsigned {
                            message: envelope.data.clone(),
                        })
                    }
                };
            }
            Err(e) => return Err(e),
        };

        debug!(
            "Resolved identity d={} s={} for {:?}",
            identity.domain, identity.selector, envelope.from
        );

        let options = SigningOptions::build(identity, &snapshot.keys).await?;
        let value = self.signer.sign(&envelope.data, &options)?;

        Ok(SignOutcome::Signed {
            message: prepend_signature(&value, &envelope.data),
            domain: options.domain,
            selector: options.selector,
        })
    }
}

/// The domain of the envelope sender
fn sending_domain(envelope: &Envelope) -> Result<&str> {
    let from = envelope
        .from
        .as_ref()
        .ok_or_else(|| Error::MalformedSender("<>".to_string()))?;

    if !from.has_host_domain() {
        return Err(Error::MalformedSender(from.to_string()));
    }

    Ok(&from.domain)
}
