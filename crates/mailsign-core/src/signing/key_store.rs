//! Private key loading and caching
//!
//! Keys are read from disk the first time an identity needs them and kept for
//! the life of the configuration snapshot. A reload builds a new store rather
//! than clearing this one. Failed loads are not cached, so a key file fixed on
//! disk is picked up by the next message.

use mailsign_common::config::SigningConfig;
use mailsign_common::{Error, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A parsed RSA key ready to produce RSA-SHA256 signatures
pub type SigningKey = rsa::pkcs1v15::SigningKey<Sha256>;

/// Smallest modulus accepted for signing (RFC 8301)
const MIN_KEY_BITS: usize = 1024;

/// Cache of parsed private keys, keyed by file path
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<PathBuf, Arc<SigningKey>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the key stored at `path`, loading it on first use
    pub async fn get(&self, path: &Path) -> Result<Arc<SigningKey>> {
        if let Some(key) = self.keys.read().await.get(path) {
            return Ok(Arc::clone(key));
        }

        // Two sessions may race to load the same key; both parse it and the
        // first insert wins.
        let key = Arc::new(SigningKey::new(load_private_key(path).await?));

        let mut keys = self.keys.write().await;
        let key = keys.entry(path.to_path_buf()).or_insert(key);
        debug!("Cached private key {}", path.display());

        Ok(Arc::clone(key))
    }

    /// Load the keys of every configured identity
    ///
    /// Failures are logged and skipped; they surface again when a message for
    /// the identity arrives. Returns the number of identities whose key
    /// loaded.
    pub async fn preload(&self, signing: &SigningConfig) -> usize {
        let mut loaded = 0;

        for (sending_domain, vhost) in &signing.virtual_hosts {
            if vhost.private_key_path.as_os_str().is_empty() {
                continue;
            }

            match self.get(&vhost.private_key_path).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Private key for {} not usable: {}", sending_domain, e),
            }
        }

        info!(
            "Loaded private keys for {} of {} virtual hosts",
            loaded,
            signing.virtual_hosts.len()
        );
        loaded
    }

    /// Number of keys currently cached
    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Read and parse a PEM-encoded PKCS#1 RSA private key
pub async fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let bytes = tokio::fs::read(path).await.map_err(|source| Error::KeyRead {
        path: path.to_path_buf(),
        source,
    })?;

    let format_error = |reason: String| Error::KeyFormat {
        path: path.to_path_buf(),
        reason,
    };

    let pem = std::str::from_utf8(&bytes)
        .map_err(|_| format_error("file is not PEM text".to_string()))?;

    if !pem.contains("-----BEGIN ") {
        return Err(format_error("no PEM block found".to_string()));
    }

    let key = RsaPrivateKey::from_pkcs1_pem(pem.trim())
        .map_err(|e| format_error(format!("not a PKCS#1 RSA private key: {}", e)))?;

    let bits = key.size() * 8;
    if bits < MIN_KEY_BITS {
        return Err(format_error(format!(
            "{}-bit key is shorter than {} bits",
            bits, MIN_KEY_BITS
        )));
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use mailsign_common::config::VirtualHostConfig;

    #[tokio::test]
    async fn test_load_pkcs1_key() {
        let key = load_private_key(Path::new(testing::RSA_2048)).await.unwrap();
        assert_eq!(key.size() * 8, 2048);
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let err = load_private_key(Path::new("/nonexistent/mailsign/key.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::KeyRead { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_garbage_is_format_error() {
        let err = load_private_key(Path::new(testing::GARBAGE)).await.unwrap_err();
        assert!(matches!(err, Error::KeyFormat { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_pkcs8_is_format_error() {
        let err = load_private_key(Path::new(testing::PKCS8)).await.unwrap_err();
        assert!(matches!(err, Error::KeyFormat { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_cache_hit_returns_same_key() {
        let store = KeyStore::new();
        let a = store.get(Path::new(testing::RSA_1024)).await.unwrap();
        let b = store.get(Path::new(testing::RSA_1024)).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let store = KeyStore::new();
        assert!(store.get(Path::new(testing::GARBAGE)).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_preload_skips_broken_keys() {
        let mut signing = SigningConfig::default();
        signing.virtual_hosts.insert(
            "good.example".into(),
            VirtualHostConfig {
                domain: "good.example".into(),
                selector: "s1".into(),
                private_key_path: testing::RSA_2048.into(),
                ..Default::default()
            },
        );
        signing.virtual_hosts.insert(
            "bad.example".into(),
            VirtualHostConfig {
                domain: "bad.example".into(),
                selector: "s1".into(),
                private_key_path: testing::GARBAGE.into(),
                ..Default::default()
            },
        );

        let store = KeyStore::new();
        assert_eq!(store.preload(&signing).await, 1);
        assert_eq!(store.len().await, 1);
    }
}
