//! # relaydesk-smtp
//!
//! A small async SMTP submission client, just large enough to verify a
//! relay's credentials and push one message at a time through it.
//!
//! ## Features
//!
//! - **Type-state sessions**: a [`Client`] must be authenticated before it
//!   can submit mail
//! - **TLS**: implicit TLS (port 465) and STARTTLS upgrade (port 587)
//! - **Authentication**: PLAIN and LOGIN, picked from the EHLO advertisement
//! - **Reply classification**: transient (4xx), permanent (5xx) and
//!   credential rejections are distinguishable on [`Error`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use relaydesk_smtp::{Address, Client, Envelope};
//! use relaydesk_smtp::connection::connect;
//!
//! #[tokio::main]
//! async fn main() -> relaydesk_smtp::Result<()> {
//!     let stream = connect("smtp.example.com", 587).await?;
//!     let client = Client::from_stream(stream).await?;
//!     let client = client.ehlo("relay.local").await?;
//!     let client = client.starttls("smtp.example.com").await?;
//!     let client = client.authenticate("user@example.com", "password").await?;
//!
//!     let envelope = Envelope::new(
//!         Address::new("user@example.com")?,
//!         Address::new("someone@example.org")?,
//!     );
//!     let client = client
//!         .send_mail(&envelope, b"Subject: Hi\r\n\r\nHello\r\n")
//!         .await?;
//!     client.quit().await
//! }
//! ```
//!
//! ## Session States
//!
//! ```text
//! Connected ── ehlo() / starttls() ──┐
//!     │                              │
//!     └──── authenticate() ───→ Authenticated ── send_mail() ──┐
//!                                     ↑                        │
//!                                     └────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod address;
pub mod command;
pub mod connection;
mod error;
mod extension;
pub mod reply;

pub use address::{Address, Envelope};
pub use connection::{Authenticated, Client, Connected, ServerInfo};
pub use error::{Error, Result};
pub use extension::{AuthMechanism, Extension};
pub use reply::{Reply, ReplyCode};
