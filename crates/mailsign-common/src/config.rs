//! Configuration for mailsign

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Main configuration structure
///
/// Loaded once at startup and treated as an immutable snapshot afterwards;
/// a reload builds a new snapshot rather than mutating this one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener and session limits
    #[serde(default)]
    pub server: ServerConfig,

    /// Next-hop relay
    #[serde(default)]
    pub relay: RelayConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// DKIM signing identities
    #[serde(default)]
    pub signing: SigningConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_address")]
    pub address: String,

    /// Host name used in the greeting and EHLO response
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Seconds a session may stay idle before it is closed
    #[serde(default = "default_max_idle_seconds")]
    pub max_idle_seconds: u64,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            domain: default_domain(),
            max_idle_seconds: default_max_idle_seconds(),
            max_message_bytes: default_max_message_bytes(),
            max_recipients: default_max_recipients(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:1025".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_max_idle_seconds() -> u64 {
    300
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_max_recipients() -> usize {
    50
}

fn default_max_connections() -> usize {
    100
}

/// Transport security towards the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelaySecurity {
    /// Plain SMTP
    None,
    /// STARTTLS upgrade, required
    #[default]
    Starttls,
    /// Implicit TLS
    Tls,
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay host
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Relay port
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Transport security
    #[serde(default)]
    pub security: RelaySecurity,

    /// Username for relay authentication
    pub username: Option<String>,

    /// Password for relay authentication
    pub password: Option<String>,

    /// Timeout for one relay attempt in seconds
    #[serde(default = "default_relay_timeout")]
    pub timeout_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            security: RelaySecurity::default(),
            username: None,
            password: None,
            timeout_seconds: default_relay_timeout(),
        }
    }
}

fn default_relay_host() -> String {
    "localhost".to_string()
}

fn default_relay_port() -> u16 {
    25
}

fn default_relay_timeout() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// DKIM canonicalization algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Canonicalization {
    /// Simple canonicalization
    #[default]
    Simple,
    /// Relaxed canonicalization
    Relaxed,
}

impl fmt::Display for Canonicalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Canonicalization::Simple => write!(f, "simple"),
            Canonicalization::Relaxed => write!(f, "relaxed"),
        }
    }
}

/// What happens to a message whose sender has no configured signing identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedDomainPolicy {
    /// Reject the transaction
    #[default]
    Reject,
    /// Relay the message without a signature
    RelayUnsigned,
}

/// Signing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Header fields signed when a virtual host does not list its own
    #[serde(default = "default_header_keys")]
    pub header_keys: Vec<String>,

    /// Policy for senders without a configured identity
    #[serde(default)]
    pub unresolved_domain: UnresolvedDomainPolicy,

    /// Signing identities keyed by sending domain
    #[serde(default)]
    pub virtual_hosts: HashMap<String, VirtualHostConfig>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            header_keys: default_header_keys(),
            unresolved_domain: UnresolvedDomainPolicy::default(),
            virtual_hosts: HashMap::new(),
        }
    }
}

fn default_header_keys() -> Vec<String> {
    [
        "From",
        "To",
        "Cc",
        "Subject",
        "Date",
        "Message-ID",
        "Reply-To",
        "In-Reply-To",
        "References",
        "MIME-Version",
        "Content-Type",
        "Content-Transfer-Encoding",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// One tenant's signing identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualHostConfig {
    /// Signing domain (d= tag)
    #[serde(default)]
    pub domain: String,

    /// Selector (s= tag)
    #[serde(default)]
    pub selector: String,

    /// Path to a PEM-encoded PKCS#1 RSA private key
    #[serde(default)]
    pub private_key_path: PathBuf,

    /// Header canonicalization
    #[serde(default)]
    pub header_canonicalization: Canonicalization,

    /// Body canonicalization
    #[serde(default)]
    pub body_canonicalization: Canonicalization,

    /// Header fields to sign; empty means the global default list
    #[serde(default)]
    pub header_keys: Vec<String>,
}

impl VirtualHostConfig {
    /// Check that the fields needed for signing are present
    pub fn validate(&self) -> Result<()> {
        let missing = if self.domain.trim().is_empty() {
            Some("domain")
        } else if self.selector.trim().is_empty() {
            Some("selector")
        } else if self.private_key_path.as_os_str().is_empty() {
            Some("private_key_path")
        } else {
            None
        };

        match missing {
            Some(field) => Err(Error::InvalidIdentityConfig {
                domain: self.domain.clone(),
                field,
            }),
            None => Ok(()),
        }
    }

    /// The header keys to sign, falling back to `defaults` when none are set
    ///
    /// Borrows either list; callers copy the result when they need to own it.
    pub fn header_keys_or<'a>(&'a self, defaults: &'a [String]) -> &'a [String] {
        if self.header_keys.is_empty() {
            defaults
        } else {
            &self.header_keys
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_toml(&content)
    }

    /// Parse, normalize and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.normalize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from an explicit path or the default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let paths = [
            PathBuf::from("./mailsign.toml"),
            PathBuf::from("/etc/mailsign/mailsign.toml"),
        ];

        for path in paths {
            if path.exists() {
                debug!("Using configuration file {}", path.display());
                return Self::from_file(&path);
            }
        }

        Err(Error::Config("No configuration file found".to_string()))
    }

    /// Lowercase the sending-domain keys of the virtual host table
    fn normalize(&mut self) -> Result<()> {
        let hosts = std::mem::take(&mut self.signing.virtual_hosts);

        for (sending_domain, vhost) in hosts {
            let key = sending_domain.trim().trim_end_matches('.').to_ascii_lowercase();
            if key.is_empty() {
                return Err(Error::Config("Empty virtual host name".to_string()));
            }
            if self.signing.virtual_hosts.insert(key.clone(), vhost).is_some() {
                return Err(Error::Config(format!(
                    "Virtual host {} is configured more than once",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Validate the configuration; any error here is fatal at startup
    pub fn validate(&self) -> Result<()> {
        self.server.address.parse::<SocketAddr>().map_err(|e| {
            Error::Config(format!("Invalid server.address {:?}: {}", self.server.address, e))
        })?;

        if self.server.max_message_bytes == 0 {
            return Err(Error::Config("server.max_message_bytes must be positive".to_string()));
        }
        if self.server.max_recipients == 0 {
            return Err(Error::Config("server.max_recipients must be positive".to_string()));
        }
        if self.server.max_connections == 0 {
            return Err(Error::Config("server.max_connections must be positive".to_string()));
        }

        for (sending_domain, vhost) in &self.signing.virtual_hosts {
            vhost.validate().map_err(|e| {
                Error::Config(format!("virtual_hosts.{}: {}", sending_domain, e))
            })?;

            for (tag, value) in [("domain", &vhost.domain), ("selector", &vhost.selector)] {
                if !is_valid_dns_label_text(value) {
                    return Err(Error::Config(format!(
                        "virtual_hosts.{}: invalid {} {:?}",
                        sending_domain, tag, value
                    )));
                }
            }

            let header_keys = vhost.header_keys_or(&self.signing.header_keys);

            if let Some(bad) = header_keys.iter().find(|k| !is_valid_field_name(k)) {
                return Err(Error::Config(format!(
                    "virtual_hosts.{}: invalid header key {:?}",
                    sending_domain, bad
                )));
            }

            // A DKIM signature must cover the From field
            if !header_keys.iter().any(|k| k.eq_ignore_ascii_case("from")) {
                return Err(Error::Config(format!(
                    "virtual_hosts.{}: header keys must include From",
                    sending_domain
                )));
            }
        }

        Ok(())
    }
}

/// Domain and selector values end up inside DKIM tags
fn is_valid_dns_label_text(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Header field names are printable ASCII without colon or space
fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}
