//! Relay credentials and their storage.

mod model;
mod repository;
mod store;

pub use model::{
    ApiDetails, ApiProvider, ProviderKind, RelayCredential, RelayEndpoint, RelayHealth, RelayId,
    Security, SmtpDetails, WebmailDetails, WebmailProvider,
};
pub use repository::{RelayRepository, SqliteRelayRepository};
pub use store::{QuotaError, RelayStore};
