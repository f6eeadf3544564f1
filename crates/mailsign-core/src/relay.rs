//! Delivery of signed messages to the next hop

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mailsign_common::config::{RelayConfig, RelaySecurity};
use mailsign_common::types::{EmailAddress, Envelope};
use mailsign_common::{Error, Result};
use std::time::Duration;
use tracing::{debug, info};

/// Hands a finished message to the next hop
#[async_trait]
pub trait Relay: Send + Sync {
    /// Relay `message` to the envelope recipients
    async fn relay(&self, envelope: &Envelope, message: &[u8]) -> Result<()>;
}

/// Relay over SMTP to the configured smarthost
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpRelay {
    /// Create a relay from configuration
    ///
    /// No connection is made until the first message.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let builder = match config.security {
            RelaySecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| Error::Relay(format!("Invalid relay host {}: {}", config.host, e)))?,
            RelaySecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(
                    |e| Error::Relay(format!("Invalid relay host {}: {}", config.host, e)),
                )?
            }
            RelaySecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };

        let mut builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            "Relaying to {}:{} ({:?})",
            config.host, config.port, config.security
        );

        Ok(Self {
            transport: builder.build(),
            host: config.host.clone(),
        })
    }
}

fn to_lettre_address(address: &EmailAddress) -> Result<Address> {
    Address::new(&address.local, &address.domain)
        .map_err(|e| Error::Relay(format!("Address {} not accepted for relay: {}", address, e)))
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn relay(&self, envelope: &Envelope, message: &[u8]) -> Result<()> {
        let from = envelope.from.as_ref().map(to_lettre_address).transpose()?;
        let to = envelope
            .to
            .iter()
            .map(to_lettre_address)
            .collect::<Result<Vec<_>>>()?;

        let relay_envelope = lettre::address::Envelope::new(from, to)
            .map_err(|e| Error::Relay(format!("Invalid envelope: {}", e)))?;

        let response = self
            .transport
            .send_raw(&relay_envelope, message)
            .await
            .map_err(|e| Error::Relay(format!("{}: {}", self.host, e)))?;

        debug!("Relay {} answered {}", self.host, response.code());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_relay_with_credentials() {
        let config = RelayConfig {
            host: "relay.example.net".into(),
            port: 2525,
            security: RelaySecurity::None,
            username: Some("user".into()),
            password: Some("secret".into()),
            timeout_seconds: 5,
        };
        let relay = SmtpRelay::new(&config).unwrap();
        assert_eq!(relay.host, "relay.example.net");
    }

    #[test]
    fn test_address_conversion() {
        let address = to_lettre_address(&EmailAddress::new("user", "example.com")).unwrap();
        assert_eq!(address.to_string(), "user@example.com");
    }
}
