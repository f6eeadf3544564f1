//! Per-connection transaction state
//!
//! Collects the envelope of one SMTP transaction, enforces the recipient and
//! size limits, and hands the finished message to the signing pipeline and
//! the relay.

use crate::relay::Relay;
use crate::signing::{SignOutcome, SigningPipeline};
use anyhow::anyhow;
use mailsign_common::config::ServerConfig;
use mailsign_common::types::{EmailAddress, Envelope};
use mailsign_common::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use uuid::Uuid;

/// Limits applied to each transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_recipients: usize,
    pub max_message_bytes: usize,
}

impl From<&ServerConfig> for SessionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_recipients: config.max_recipients,
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// What happened to an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub transaction_id: Uuid,
    /// `(d=, s=)` of the signature, `None` when relayed unsigned
    pub signed_by: Option<(String, String)>,
    pub size: usize,
}

/// State of one client connection
pub struct Session {
    limits: SessionLimits,
    pipeline: Arc<SigningPipeline>,
    relay: Arc<dyn Relay>,
    transaction: Option<(Uuid, Envelope)>,
}

impl Session {
    pub fn new(limits: SessionLimits, pipeline: Arc<SigningPipeline>, relay: Arc<dyn Relay>) -> Self {
        Self {
            limits,
            pipeline,
            relay,
            transaction: None,
        }
    }

    /// Start a transaction for `address`
    ///
    /// `<>` and the empty string are the null reverse-path.
    pub fn accept_sender(&mut self, address: &str) -> Result<()> {
        let address = strip_brackets(address);

        let from = if address.is_empty() {
            None
        } else {
            Some(
                EmailAddress::parse(address)
                    .ok_or_else(|| Error::InvalidSender(address.to_string()))?,
            )
        };

        let id = Uuid::now_v7();
        info!("Transaction {} started for {:?}", id, from);
        self.transaction = Some((id, Envelope::new(from)));
        Ok(())
    }

    /// Add a recipient to the current transaction
    pub fn accept_recipient(&mut self, address: &str) -> Result<()> {
        let (_, envelope) = self
            .transaction
            .as_mut()
            .ok_or_else(|| Error::Other(anyhow!("recipient given before sender")))?;

        let address = strip_brackets(address);
        let to = EmailAddress::parse(address)
            .ok_or_else(|| Error::InvalidRecipient(address.to_string()))?;

        if envelope.to.len() >= self.limits.max_recipients {
            return Err(Error::TooManyRecipients {
                limit: self.limits.max_recipients,
            });
        }

        envelope.to.push(to);
        Ok(())
    }

    /// Read the message from `stream`, sign it and relay it
    ///
    /// The transaction ends here whatever the result.
    pub async fn accept_data<R: AsyncRead + Unpin>(&mut self, stream: R) -> Result<Delivery> {
        let (id, mut envelope) = self
            .transaction
            .take()
            .ok_or_else(|| Error::Other(anyhow!("data given before sender")))?;

        if envelope.to.is_empty() {
            return Err(Error::Other(anyhow!("no recipients given")));
        }

        let limit = self.limits.max_message_bytes;
        let mut data = Vec::new();
        stream.take(limit as u64 + 1).read_to_end(&mut data).await?;

        if data.len() > limit {
            warn!("Transaction {}: message exceeds {} bytes", id, limit);
            return Err(Error::MessageTooLarge { limit });
        }

        envelope.data = data;
        let size = envelope.data.len();

        let outcome = self.pipeline.sign(&envelope).await.map_err(|e| {
            warn!("Transaction {}: not signed: {}", id, e);
            e
        })?;

        self.relay.relay(&envelope, outcome.message()).await.map_err(|e| {
            warn!("Transaction {}: relay failed: {}", id, e);
            e
        })?;

        let signed_by = match outcome {
            SignOutcome::Signed {
                domain, selector, ..
            } => Some((domain, selector)),
            SignOutcome::Unsigned { .. } => None,
        };

        info!(
            "Transaction {}: relayed {} bytes to {} recipients, signed by {:?}",
            id,
            size,
            envelope.to.len(),
            signed_by
        );

        Ok(Delivery {
            transaction_id: id,
            signed_by,
            size,
        })
    }

    /// Abandon the current transaction
    pub fn reset(&mut self) {
        self.transaction = None;
    }

    pub fn has_sender(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn recipient_count(&self) -> usize {
        self.transaction.as_ref().map_or(0, |(_, e)| e.to.len())
    }
}

fn strip_brackets(address: &str) -> &str {
    let address = address.trim();
    address
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::ConfigHandle;
    use crate::testing::{self, RecordingRelay};
    use mailsign_common::config::UnresolvedDomainPolicy;
    use mailsign_common::Config;
    use pretty_assertions::assert_eq;

    const MESSAGE: &[u8] = b"From: a@example.com\r\nTo: b@test.org\r\nSubject: Hi\r\n\r\nhello\r\n";

    fn session_with(config: Config, relay: Arc<RecordingRelay>) -> Session {
        let limits = SessionLimits::from(&config.server);
        let pipeline = SigningPipeline::new(Arc::new(ConfigHandle::new(config)));
        Session::new(limits, Arc::new(pipeline), relay)
    }

    #[tokio::test]
    async fn test_signed_message_is_relayed() {
        let relay = Arc::new(RecordingRelay::default());
        let mut session = session_with(testing::config(), relay.clone());

        session.accept_sender("<a@example.com>").unwrap();
        session.accept_recipient("<b@test.org>").unwrap();
        let delivery = session.accept_data(MESSAGE).await.unwrap();

        assert_eq!(
            delivery.signed_by,
            Some(("example.com".to_string(), "mail".to_string()))
        );
        assert!(!session.has_sender());

        let sent = relay.sent();
        assert_eq!(sent.len(), 1);
        let (envelope, message) = &sent[0];
        assert_eq!(envelope.to, vec![EmailAddress::new("b", "test.org")]);
        assert!(message.starts_with(b"DKIM-Signature: v=1;"));
        assert!(message.ends_with(MESSAGE));
    }

    #[tokio::test]
    async fn test_recipient_limit_is_inclusive() {
        let relay = Arc::new(RecordingRelay::default());
        let mut session = session_with(testing::config(), relay);
        session.accept_sender("a@example.com").unwrap();

        for i in 0..3 {
            session.accept_recipient(&format!("r{}@test.org", i)).unwrap();
        }
        let err = session.accept_recipient("r3@test.org").unwrap_err();
        assert!(matches!(err, Error::TooManyRecipients { limit: 3 }));
        assert_eq!(session.recipient_count(), 3);
    }

    #[tokio::test]
    async fn test_message_size_limit_is_inclusive() {
        let mut config = testing::config();
        config.signing.unresolved_domain = UnresolvedDomainPolicy::RelayUnsigned;
        let limit = config.server.max_message_bytes;
        let relay = Arc::new(RecordingRelay::default());
        let mut session = session_with(config, relay.clone());

        let exact = vec![b'x'; limit];
        session.accept_sender("a@unknown.example").unwrap();
        session.accept_recipient("b@test.org").unwrap();
        let delivery = session.accept_data(&exact[..]).await.unwrap();
        assert_eq!(delivery.size, limit);
        assert_eq!(delivery.signed_by, None);

        let over = vec![b'x'; limit + 1];
        session.accept_sender("a@unknown.example").unwrap();
        session.accept_recipient("b@test.org").unwrap();
        let err = session.accept_data(&over[..]).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));

        assert_eq!(relay.sent().len(), 1);
        assert!(!session.has_sender());
    }

    #[tokio::test]
    async fn test_null_sender() {
        let relay = Arc::new(RecordingRelay::default());
        let mut session = session_with(testing::config(), relay.clone());

        session.accept_sender("<>").unwrap();
        session.accept_recipient("b@test.org").unwrap();
        let err = session.accept_data(MESSAGE).await.unwrap_err();

        assert!(matches!(err, Error::MalformedSender(_)));
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn test_bad_addresses() {
        let relay = Arc::new(RecordingRelay::default());
        let mut session = session_with(testing::config(), relay);

        assert!(matches!(
            session.accept_sender("not an address"),
            Err(Error::InvalidSender(_))
        ));
        assert!(session.accept_recipient("b@test.org").is_err());

        session.accept_sender("a@example.com").unwrap();
        assert!(matches!(
            session.accept_recipient("nobody"),
            Err(Error::InvalidRecipient(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_failure_ends_transaction() {
        let relay = Arc::new(RecordingRelay::failing());
        let mut session = session_with(testing::config(), relay);

        session.accept_sender("a@example.com").unwrap();
        session.accept_recipient("b@test.org").unwrap();
        let err = session.accept_data(MESSAGE).await.unwrap_err();

        assert!(matches!(err, Error::Relay(_)));
        assert!(!session.has_sender());
    }

    #[tokio::test]
    async fn test_reset_discards_envelope() {
        let relay = Arc::new(RecordingRelay::default());
        let mut session = session_with(testing::config(), relay);

        session.accept_sender("a@example.com").unwrap();
        session.accept_recipient("b@test.org").unwrap();
        session.reset();

        assert!(!session.has_sender());
        assert_eq!(session.recipient_count(), 0);
    }
}
