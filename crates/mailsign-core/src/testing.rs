//! Fixtures shared by unit tests

use crate::relay::Relay;
use crate::signing::SigningKey;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailsign_common::config::{Canonicalization, VirtualHostConfig};
use mailsign_common::types::Envelope;
use mailsign_common::{Config, Error, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use viadkim::verifier::LookupTxt;

pub const RSA_1024: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/rsa1024.pem");
pub const RSA_2048: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/rsa2048.pem");
pub const PKCS8: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/pkcs8.pem");
pub const GARBAGE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/testdata/garbage.pem");

pub fn signing_key_1024() -> SigningKey {
    let pem = std::fs::read_to_string(RSA_1024).unwrap();
    SigningKey::new(RsaPrivateKey::from_pkcs1_pem(pem.trim()).unwrap())
}

/// The DKIM key record publishing the public half of the key at `path`
pub fn key_record(path: &str) -> String {
    let pem = std::fs::read_to_string(path).unwrap();
    let key = RsaPrivateKey::from_pkcs1_pem(pem.trim()).unwrap();
    let der = RsaPublicKey::from(&key).to_public_key_der().unwrap();
    format!("v=DKIM1; k=rsa; p={}", BASE64.encode(der.as_bytes()))
}

pub fn vhost(domain: &str, key_path: &str) -> VirtualHostConfig {
    VirtualHostConfig {
        domain: domain.into(),
        selector: "mail".into(),
        private_key_path: key_path.into(),
        header_canonicalization: Canonicalization::Relaxed,
        body_canonicalization: Canonicalization::Relaxed,
        header_keys: Vec::new(),
    }
}

/// One identity, example.com/mail, relaxed/relaxed, signing From:To:Subject
pub fn config() -> Config {
    let mut config = Config::default();
    config.server.max_recipients = 3;
    config.server.max_message_bytes = 1024;
    config.signing.header_keys = vec!["From".into(), "To".into(), "Subject".into()];
    config
        .signing
        .virtual_hosts
        .insert("example.com".into(), vhost("example.com", RSA_1024));
    config
}

/// Relay that records what it was given
#[derive(Default)]
pub struct RecordingRelay {
    pub sent: Mutex<Vec<(Envelope, Vec<u8>)>>,
    pub fail: bool,
}

impl RecordingRelay {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(Envelope, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Relay for RecordingRelay {
    async fn relay(&self, envelope: &Envelope, message: &[u8]) -> Result<()> {
        if self.fail {
            return Err(Error::Relay("connection refused".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((envelope.clone(), message.to_vec()));
        Ok(())
    }
}

/// TXT lookup answering from a fixed set of records
#[derive(Clone, Default)]
pub struct MockLookupTxt {
    records: Arc<HashMap<String, String>>,
}

impl MockLookupTxt {
    /// Publish `record` for `selector` under `domain`
    pub fn with_key(selector: &str, domain: &str, record: String) -> Self {
        let name = format!("{}._domainkey.{}.", selector, domain);
        Self {
            records: Arc::new(HashMap::from([(name, record)])),
        }
    }
}

impl LookupTxt for MockLookupTxt {
    type Answer = Vec<io::Result<Vec<u8>>>;
    type Query<'a> = Pin<Box<dyn Future<Output = io::Result<Self::Answer>> + Send + 'a>>;

    fn lookup_txt(&self, domain: &str) -> Self::Query<'_> {
        let answer = match self.records.get(domain) {
            Some(record) => Ok(vec![Ok(record.clone().into_bytes())]),
            None => Err(io::ErrorKind::NotFound.into()),
        };
        Box::pin(async move { answer })
    }
}
