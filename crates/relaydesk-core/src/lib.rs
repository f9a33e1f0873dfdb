//! # relaydesk-core
//!
//! Core logic for the `RelayDesk` bulk relay manager.
//!
//! This crate provides:
//! - **Ingestion** - parsing credential lines in several grammars, resolving
//!   provider endpoints, and bulk import from text, CSV and Excel files
//! - **Relay storage** - an in-memory relay store with optional `SQLite`
//!   write-through and per-day send quotas
//! - **Validation** - bounded-concurrency SMTP and API handshakes
//! - **Dispatch** - paced, round-robin campaign delivery with retries,
//!   relay fail-over and cancellation

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
mod error;
pub mod ingest;
pub mod relay;
pub mod transport;
pub mod validate;

pub use config::CoreConfig;
pub use dispatch::{
    CampaignHandle, CampaignId, CampaignReport, CampaignRequest, DispatchScheduler, SendTask,
    TaskEvent, TaskStatus,
};
pub use error::{Error, Result};
pub use ingest::{BatchImporter, FormatHint, ImportBatchResult, ProviderResolver};
pub use relay::{RelayCredential, RelayHealth, RelayId, RelayStore, SqliteRelayRepository};
pub use transport::{DeliveryError, FailureClass, MailTransport, RelayTransport};
pub use validate::{RelayValidator, ValidationReport};
