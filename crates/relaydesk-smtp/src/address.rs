//! Envelope addresses.

use crate::error::{Error, Result};

/// Email address as used in `MAIL FROM` / `RCPT TO`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is empty, lacks a single `@`, or
    /// contains characters that would break the command line.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into().trim().to_string();

        if addr.is_empty() {
            return Err(Error::InvalidAddress("address cannot be empty".into()));
        }
        if addr.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
            return Err(Error::InvalidAddress(format!(
                "address contains forbidden characters: {addr}"
            )));
        }

        match addr.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(Self(addr))
            }
            _ => Err(Error::InvalidAddress(format!(
                "address must be local@domain: {addr}"
            ))),
        }
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sender and recipients of one SMTP transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path.
    pub from: Address,
    /// Forward paths; never empty.
    pub to: Vec<Address>,
}

impl Envelope {
    /// Creates an envelope with a single recipient.
    #[must_use]
    pub fn new(from: Address, to: Address) -> Self {
        Self { from, to: vec![to] }
    }

    /// Adds another recipient.
    #[must_use]
    pub fn and_to(mut self, to: Address) -> Self {
        self.to.push(to);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_address() {
        let addr = Address::new("user@example.com").unwrap();
        assert_eq!(addr.as_str(), "user@example.com");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let addr = Address::new("  user@example.com ").unwrap();
        assert_eq!(addr.to_string(), "user@example.com");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Address::new("").is_err());
        assert!(Address::new("userexample.com").is_err());
        assert!(Address::new("@example.com").is_err());
        assert!(Address::new("user@").is_err());
        assert!(Address::new("a@b@c").is_err());
        assert!(Address::new("user name@example.com").is_err());
        assert!(Address::new("<user@example.com>").is_err());
    }

    #[test]
    fn envelope_collects_recipients() {
        let envelope = Envelope::new(
            Address::new("from@example.com").unwrap(),
            Address::new("a@example.org").unwrap(),
        )
        .and_to(Address::new("b@example.org").unwrap());
        assert_eq!(envelope.to.len(), 2);
    }
}
