//! SMTP command serialization.

use crate::address::Address;
use crate::extension::AuthMechanism;

/// Commands the submission client issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: AuthMechanism,
        /// Initial response (SASL-IR)
        initial_response: Option<String>,
    },
    /// Bare base64 line answering a 334 challenge.
    AuthContinuation(String),
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address
        from: Address,
        /// Announce an 8-bit body
        eight_bit: bool,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Abort the current transaction
    Rset,
    /// QUIT - Close connection
    Quit,
}

impl Command {
    /// Serializes the command, including the trailing CRLF.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let line = match self {
            Self::Ehlo { hostname } => format!("EHLO {hostname}"),
            Self::StartTls => "STARTTLS".to_string(),
            Self::Auth {
                mechanism,
                initial_response: Some(resp),
            } => format!("AUTH {} {resp}", mechanism.as_str()),
            Self::Auth {
                mechanism,
                initial_response: None,
            } => format!("AUTH {}", mechanism.as_str()),
            Self::AuthContinuation(resp) => resp.clone(),
            Self::MailFrom { from, eight_bit } => {
                if *eight_bit {
                    format!("MAIL FROM:<{from}> BODY=8BITMIME")
                } else {
                    format!("MAIL FROM:<{from}>")
                }
            }
            Self::RcptTo { to } => format!("RCPT TO:<{to}>"),
            Self::Data => "DATA".to_string(),
            Self::Rset => "RSET".to_string(),
            Self::Quit => "QUIT".to_string(),
        };

        let mut buf = line.into_bytes();
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Whether the serialized form carries a secret and must not be logged.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::AuthContinuation(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ehlo() {
        let cmd = Command::Ehlo {
            hostname: "relay.local".to_string(),
        };
        assert_eq!(cmd.serialize(), b"EHLO relay.local\r\n");
    }

    #[test]
    fn auth_with_initial_response() {
        let cmd = Command::Auth {
            mechanism: AuthMechanism::Plain,
            initial_response: Some("AHVzZXIAcGFzcw==".to_string()),
        };
        assert_eq!(cmd.serialize(), b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n");
        assert!(cmd.is_sensitive());
    }

    #[test]
    fn auth_login_then_continuation() {
        let cmd = Command::Auth {
            mechanism: AuthMechanism::Login,
            initial_response: None,
        };
        assert_eq!(cmd.serialize(), b"AUTH LOGIN\r\n");
        let cont = Command::AuthContinuation("dXNlcg==".to_string());
        assert_eq!(cont.serialize(), b"dXNlcg==\r\n");
        assert!(cont.is_sensitive());
    }

    #[test]
    fn mail_from_variants() {
        let from = Address::new("sender@example.com").unwrap();
        let plain = Command::MailFrom {
            from: from.clone(),
            eight_bit: false,
        };
        assert_eq!(plain.serialize(), b"MAIL FROM:<sender@example.com>\r\n");

        let eight = Command::MailFrom {
            from,
            eight_bit: true,
        };
        assert_eq!(
            eight.serialize(),
            b"MAIL FROM:<sender@example.com> BODY=8BITMIME\r\n"
        );
    }

    #[test]
    fn transaction_commands() {
        let rcpt = Command::RcptTo {
            to: Address::new("rcpt@example.org").unwrap(),
        };
        assert_eq!(rcpt.serialize(), b"RCPT TO:<rcpt@example.org>\r\n");
        assert_eq!(Command::Data.serialize(), b"DATA\r\n");
        assert_eq!(Command::Rset.serialize(), b"RSET\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
        assert!(!Command::Quit.is_sensitive());
    }
}
