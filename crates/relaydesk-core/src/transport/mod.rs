//! Delivery through a relay.
//!
//! [`RelayTransport`] is the seam between the dispatch core and the network:
//! the validator and the sender only ever talk to this trait, so tests can
//! script outcomes without sockets.

mod api;
mod message;
mod smtp;

pub use api::ApiTransport;
pub use message::OutgoingMessage;
pub use smtp::SmtpTransport;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::relay::{RelayCredential, RelayEndpoint};

/// How the sender reacts to a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureClass {
    /// Worth retrying: timeouts, dropped connections, 4xx, HTTP 429/5xx.
    Transient,
    /// The message itself was refused.
    Permanent,
    /// The relay cannot send at all: credentials refused, blocklisted.
    RelayBroken,
}

/// A failed verification or delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DeliveryError {
    class: FailureClass,
    message: String,
}

impl DeliveryError {
    /// Creates an error of the given class.
    #[must_use]
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Retryable failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    /// Message-level refusal.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Permanent, message)
    }

    /// Relay-level refusal.
    #[must_use]
    pub fn relay_broken(message: impl Into<String>) -> Self {
        Self::new(FailureClass::RelayBroken, message)
    }

    /// An operation ran past its deadline.
    #[must_use]
    pub fn timed_out(after: Duration) -> Self {
        Self::transient(format!("timed out after {}s", after.as_secs()))
    }

    /// Failure class.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        self.class
    }

    /// Human-readable reason.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Something that can check and use a relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Connects and authenticates without sending anything.
    async fn verify(&self, relay: &RelayCredential) -> Result<(), DeliveryError>;

    /// Delivers one message through the relay.
    async fn send(&self, relay: &RelayCredential, message: &OutgoingMessage) -> Result<(), DeliveryError>;
}

/// Routes each relay to the transport its endpoint needs.
#[derive(Debug, Clone)]
pub struct MailTransport {
    smtp: SmtpTransport,
    api: ApiTransport,
}

impl MailTransport {
    /// Creates the default transports.
    #[must_use]
    pub fn new(helo_name: impl Into<String>, http_timeout: Duration) -> Self {
        Self {
            smtp: SmtpTransport::new(helo_name),
            api: ApiTransport::new(http_timeout),
        }
    }

    /// Combines explicit transports.
    #[must_use]
    pub const fn from_parts(smtp: SmtpTransport, api: ApiTransport) -> Self {
        Self { smtp, api }
    }
}

#[async_trait]
impl RelayTransport for MailTransport {
    async fn verify(&self, relay: &RelayCredential) -> Result<(), DeliveryError> {
        match relay.endpoint {
            RelayEndpoint::Smtp(_) | RelayEndpoint::Webmail(_) => self.smtp.verify(relay).await,
            RelayEndpoint::Api(_) => self.api.verify(relay).await,
        }
    }

    async fn send(&self, relay: &RelayCredential, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        match relay.endpoint {
            RelayEndpoint::Smtp(_) | RelayEndpoint::Webmail(_) => self.smtp.send(relay, message).await,
            RelayEndpoint::Api(_) => self.api.send(relay, message).await,
        }
    }
}
