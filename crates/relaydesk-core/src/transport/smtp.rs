//! SMTP and webmail relays.

use async_trait::async_trait;
use relaydesk_smtp::connection::{connect, connect_tls};
use relaydesk_smtp::{Address, Authenticated, Client, Envelope};
use tracing::debug;

use super::{DeliveryError, FailureClass, OutgoingMessage, RelayTransport};
use crate::relay::{RelayCredential, Security};

/// Reply text that means the relay itself is blocked.
const BLOCKLIST_MARKERS: [&str; 4] = ["blacklist", "blocklist", "blocked", "spamhaus"];

/// Speaks SMTP submission through `relaydesk-smtp`.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    helo_name: String,
}

impl SmtpTransport {
    /// Creates a transport announcing `helo_name` in EHLO.
    #[must_use]
    pub fn new(helo_name: impl Into<String>) -> Self {
        Self {
            helo_name: helo_name.into(),
        }
    }

    /// Connects, upgrades as the relay's security mode says, and logs in.
    async fn open(&self, relay: &RelayCredential) -> Result<Client<Authenticated>, DeliveryError> {
        let (host, port, security) = relay
            .endpoint
            .smtp_target()
            .ok_or_else(|| DeliveryError::relay_broken("relay has no SMTP endpoint"))?;

        let stream = match security {
            Security::Tls => connect_tls(host, port).await,
            Security::StartTls | Security::None => connect(host, port).await,
        }
        .map_err(|e| classify(&e))?;

        let client = Client::from_stream(stream).await.map_err(|e| classify(&e))?;
        let client = client.ehlo(&self.helo_name).await.map_err(|e| classify(&e))?;
        let client = if security == Security::StartTls {
            client.starttls(host).await.map_err(|e| classify(&e))?
        } else {
            client
        };

        debug!(relay = %relay.id, host, port, "Authenticating");
        client
            .authenticate(&relay.username, &relay.secret)
            .await
            .map_err(|e| classify(&e))
    }
}

#[async_trait]
impl RelayTransport for SmtpTransport {
    async fn verify(&self, relay: &RelayCredential) -> Result<(), DeliveryError> {
        let client = self.open(relay).await?;
        if let Err(e) = client.quit().await {
            debug!(relay = %relay.id, "QUIT after verification failed: {e}");
        }
        Ok(())
    }

    async fn send(&self, relay: &RelayCredential, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        let from = Address::new(&relay.from_email)
            .map_err(|e| DeliveryError::relay_broken(format!("sender address: {e}")))?;
        let to = Address::new(&message.to).map_err(|e| DeliveryError::permanent(e.to_string()))?;
        let envelope = Envelope::new(from, to);

        let client = self.open(relay).await?;
        let client = client
            .send_mail(&envelope, message.to_rfc5322().as_bytes())
            .await
            .map_err(|e| classify(&e))?;

        if let Err(e) = client.quit().await {
            debug!(relay = %relay.id, "QUIT after delivery failed: {e}");
        }
        Ok(())
    }
}

/// Maps a client error onto the sender's retry policy.
pub(crate) fn classify(error: &relaydesk_smtp::Error) -> DeliveryError {
    use relaydesk_smtp::Error;

    let class = match error {
        e if e.is_auth_rejection() => FailureClass::RelayBroken,
        Error::Rejected { message, .. } if error.is_permanent() && mentions_blocklist(message) => {
            FailureClass::RelayBroken
        }
        e if e.is_permanent() => FailureClass::Permanent,
        Error::NotSupported(_) => FailureClass::RelayBroken,
        Error::InvalidAddress(_) => FailureClass::Permanent,
        Error::Io(_) | Error::Tls(_) | Error::Protocol(_) | Error::Rejected { .. } => FailureClass::Transient,
    };
    DeliveryError::new(class, error.to_string())
}

fn mentions_blocklist(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    BLOCKLIST_MARKERS.iter().any(|marker| text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydesk_smtp::Error;

    #[test]
    fn auth_rejection_breaks_relay() {
        let err = classify(&Error::rejected(535, "5.7.8 Username and Password not accepted"));
        assert_eq!(err.class(), FailureClass::RelayBroken);
    }

    #[test]
    fn blocklisted_relay_is_broken() {
        let err = classify(&Error::rejected(554, "Service unavailable; client host blocked using Spamhaus"));
        assert_eq!(err.class(), FailureClass::RelayBroken);
    }

    #[test]
    fn mailbox_unavailable_is_permanent() {
        let err = classify(&Error::rejected(550, "No such user"));
        assert_eq!(err.class(), FailureClass::Permanent);
    }

    #[test]
    fn temporary_rejections_and_io_are_transient() {
        assert_eq!(classify(&Error::rejected(421, "try later")).class(), FailureClass::Transient);
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify(&io).class(), FailureClass::Transient);
    }

    #[test]
    fn missing_extension_breaks_relay() {
        let err = classify(&Error::NotSupported("STARTTLS".into()));
        assert_eq!(err.class(), FailureClass::RelayBroken);
    }
}
