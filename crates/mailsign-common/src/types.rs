//! Common types for mailsign

/// Email address as given in an SMTP reverse-path or forward-path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    ///
    /// The split happens at the last `@`, so quoted local parts containing an
    /// `@` survive. Whitespace, control characters and angle brackets are
    /// rejected anywhere in the address.
    pub fn parse(s: &str) -> Option<Self> {
        if s.chars().any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>') {
            return None;
        }

        let (local, domain) = s.rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }

        Some(Self::new(local, domain))
    }

    /// Whether the domain part is a host name usable as a signing lookup key
    ///
    /// Address literals such as `[192.0.2.1]` and names with empty labels are
    /// not.
    pub fn has_host_domain(&self) -> bool {
        self.domain
            .trim_end_matches('.')
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            })
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::InvalidSender(s.to_string()))
    }
}

/// Message envelope for one SMTP transaction
///
/// Created at MAIL FROM, filled through RCPT TO and DATA, and consumed when the
/// transaction ends.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Sender (MAIL FROM); `None` for the null reverse-path `<>`
    pub from: Option<EmailAddress>,

    /// Recipients (RCPT TO), in the order given
    pub to: Vec<EmailAddress>,

    /// Raw message: header block, empty line, body
    pub data: Vec<u8>,
}

impl Envelope {
    /// Create an envelope for the given sender with no recipients or data yet
    pub fn new(from: Option<EmailAddress>) -> Self {
        Self {
            from,
            to: Vec::new(),
            data: Vec::new(),
        }
    }
}
