//! Shared configuration snapshot and reloading
//!
//! Sessions take a [`Snapshot`] when a transaction starts and keep using it
//! until the transaction ends. A snapshot pairs the configuration with the key
//! cache built for it, so an identity's selector and its key always come from
//! the same reload. A reload swaps in a new snapshot for later transactions; it
//! never changes one that is already in use.

use crate::signing::KeyStore;
use mailsign_common::{Config, Result};
use std::mem;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info, warn};

/// A configuration together with the keys loaded for it
#[derive(Clone)]
pub struct Snapshot {
    pub config: Arc<Config>,
    pub keys: Arc<KeyStore>,
}

/// The current configuration snapshot
pub struct ConfigHandle {
    current: RwLock<Snapshot>,
}

impl ConfigHandle {
    /// Create a handle with an empty key cache
    pub fn new(config: Config) -> Self {
        Self::with_keys(config, Arc::new(KeyStore::new()))
    }

    /// Create a handle around keys already loaded for `config`
    pub fn with_keys(config: Config, keys: Arc<KeyStore>) -> Self {
        Self {
            current: RwLock::new(Snapshot {
                config: Arc::new(config),
                keys,
            }),
        }
    }

    /// The snapshot new transactions should use
    pub fn snapshot(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The configuration of the current snapshot
    pub fn current(&self) -> Arc<Config> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current.config)
    }

    /// Install `config` with its key cache and return the snapshot it replaces
    pub fn replace(&self, config: Config, keys: Arc<KeyStore>) -> Snapshot {
        let next = Snapshot {
            config: Arc::new(config),
            keys,
        };
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        mem::replace(&mut *current, next)
    }
}

/// Re-read the configuration file and install it
///
/// An invalid file leaves the running configuration in place. Settings that
/// only take effect at startup keep their old values. Keys are loaded into a
/// fresh cache before the swap; the old cache goes away with the last
/// transaction still using it.
pub async fn reload(handle: &ConfigHandle, path: Option<&Path>) -> Result<()> {
    info!("Reloading configuration");

    let mut config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to reload configuration, keeping the current one: {}", e);
            return Err(e);
        }
    };

    let old = handle.current();

    if config.server.address != old.server.address {
        warn_param_not_reloaded("server.address");
        config.server.address = old.server.address.clone();
    }
    if config.logging != old.logging {
        warn_param_not_reloaded("logging");
        config.logging = old.logging.clone();
    }

    let keys = Arc::new(KeyStore::new());
    keys.preload(&config.signing).await;

    handle.replace(config, keys);

    info!("Configuration reloaded");
    Ok(())
}

fn warn_param_not_reloaded(name: &str) {
    warn!("New value for {} not applied, restart needed", name);
}
