//! Error types for SMTP operations.

use std::io;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Server rejected a command.
    #[error("SMTP error {code}: {message}")]
    Rejected {
        /// Reply code (e.g., 550).
        code: u16,
        /// Error message from server.
        message: String,
    },

    /// Server closed the connection or answered out of protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Feature not offered by the server.
    #[error("Server does not support {0}")]
    NotSupported(String),
}

impl Error {
    /// Creates a rejection error from a reply code and message.
    #[must_use]
    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Returns the reply code if the server rejected a command.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if this is a permanent rejection (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 500 && *code < 600)
    }

    /// Returns true if this is a transient rejection (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 400 && *code < 500)
    }

    /// Returns true if the server refused the credentials.
    ///
    /// Covers 530 (auth required), 534 (mechanism too weak) and
    /// 535 (credentials invalid).
    #[must_use]
    pub const fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Rejected { code: 530 | 534 | 535, .. })
    }

    /// Returns true for failures of the transport itself rather than a
    /// reply from the server (socket, TLS, dropped connection).
    #[must_use]
    pub const fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Tls(_) | Self::Protocol(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reply_codes() {
        assert!(Error::rejected(451, "try later").is_transient());
        assert!(!Error::rejected(451, "try later").is_permanent());
        assert!(Error::rejected(550, "no such user").is_permanent());
        assert!(Error::rejected(535, "bad credentials").is_auth_rejection());
        assert!(!Error::rejected(550, "no such user").is_auth_rejection());
    }

    #[test]
    fn code_only_for_rejections() {
        assert_eq!(Error::rejected(421, "bye").code(), Some(421));
        assert_eq!(Error::Protocol("eof".into()).code(), None);
        assert!(Error::Protocol("eof".into()).is_connection_failure());
    }
}
